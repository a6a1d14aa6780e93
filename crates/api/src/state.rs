//! Application state

use market_settlement::Settlement;

use crate::config::Config;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub settlement: Settlement,
}

impl AppState {
    pub fn new(config: Config, settlement: Settlement) -> Self {
        Self { config, settlement }
    }
}
