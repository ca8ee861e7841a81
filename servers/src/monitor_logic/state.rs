use std::sync::Arc;
use std::time::Duration;

use lib_common::core::Dispatcher;
use lib_common::ingestors::PollStats;

#[derive(Clone)]
pub struct AppState {
    // Hub every socket registers with
    pub dispatcher: Arc<Dispatcher>,
    // Poll loop counters, read by /status
    pub stats: Arc<PollStats>,
    // Per-frame write deadline of a socket
    pub send_timeout: Duration,
}

impl AppState {
    pub fn new(dispatcher: Arc<Dispatcher>, stats: Arc<PollStats>, send_timeout: Duration) -> Self {
        Self {
            dispatcher,
            stats,
            send_timeout,
        }
    }
}
