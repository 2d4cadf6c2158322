//! Shared state handed to every axum handler.

use std::sync::Arc;

use crate::cache::CapabilityCache;
use crate::config::Config;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub cache: Arc<CapabilityCache>,
    pub client: reqwest::Client,
}

impl AppState {
    pub fn new(config: Config, client: reqwest::Client) -> Self {
        Self {
            config: Arc::new(config),
            cache: Arc::new(CapabilityCache::new()),
            client,
        }
    }
}
