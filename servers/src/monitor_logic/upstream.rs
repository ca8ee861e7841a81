use std::sync::Arc;

use anyhow::Result;
use tokio::sync::broadcast;

use lib_common::core::{Dispatcher, DispatcherConfig};
use lib_common::cosmos::CosmosClient;
use lib_common::ingestors::{ConsensusPoller, PollerConfig};

use crate::monitor_logic::config::Settings;

/// Builds the node client, the hub and the poll loop from `settings`.
pub fn build(settings: &Settings) -> Result<(ConsensusPoller<CosmosClient>, Arc<Dispatcher>)> {
    let client = CosmosClient::new(&settings.api, &settings.rpc, settings.request_timeout)?;

    let dispatcher = Arc::new(Dispatcher::new(
        client.data_sources(),
        DispatcherConfig {
            client_buffer: settings.client_buffer,
            send_timeout: settings.send_timeout,
        },
    ));

    let poller = ConsensusPoller::new(
        client,
        dispatcher.clone(),
        PollerConfig {
            poll_interval: settings.poll_interval,
            metric: settings.metric,
        },
    );

    Ok((poller, dispatcher))
}

pub async fn run(poller: ConsensusPoller<CosmosClient>, shutdown: broadcast::Receiver<()>) {
    tracing::info!("Upstream poller starting.");
    poller.run(shutdown).await;
    tracing::info!("Upstream poller stopped.");
}
