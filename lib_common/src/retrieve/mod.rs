//! # Data Retrieval Module
//!
//! Generic HTTP clients shared by the upstream API clients.
//!
//! ## Contained Modules:
//!
//! - **`ky_http`**: A JSON `ApiClient` built on `reqwest` and
//!   `reqwest-middleware`, with per-request timeouts and optional retries
//!   with exponential backoff. `cosmos::CosmosClient` wraps one client for
//!   the REST API and one for the RPC endpoint.

/// Generic HTTP API client with retry middleware for resilient network requests.
pub mod ky_http;
