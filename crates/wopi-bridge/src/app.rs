//! The shared server state threaded through every handler and the
//! coordinator, held behind a single `Arc`.

use std::collections::HashMap;
use std::sync::Arc;

use wopi_adapters::AppAdapter;
use wopi_client::WopiClient;

use crate::config::BridgeConfig;
use crate::registry::Registry;

pub struct AppState {
    pub config: Arc<BridgeConfig>,
    pub wopi: Arc<WopiClient>,
    pub adapters: Arc<HashMap<String, Arc<dyn AppAdapter>>>,
    pub registry: Arc<Registry>,
}
