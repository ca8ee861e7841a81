pub mod config;
pub mod downstream;
pub mod state;
pub mod upstream;
