pub mod batcher;
pub mod config;
pub mod ledger;
pub mod repair;
pub mod status;

use std::sync::Arc;

use hourglass_core::{Clock, ReportExecutor};

use config::Config;
use ledger::LedgerStore;

pub fn get_service_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

/// Shared state behind the HTTP surface and the sync loop.
pub struct AppState {
    pub store: Arc<dyn LedgerStore>,
    pub executor: Arc<dyn ReportExecutor>,
    pub clock: Arc<dyn Clock>,
    pub config: Config,
}
