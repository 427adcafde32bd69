use std::collections::HashMap;
use std::sync::Arc;

use crate::config::{ApiToken, Config};
use crate::manager::RouteManager;

/// Shared application state passed to all handlers.
#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<RouteManager>,
    /// Bearer token -> grant.
    pub tokens: Arc<HashMap<String, ApiToken>>,
}

impl AppState {
    pub fn new(manager: Arc<RouteManager>, tokens: &[ApiToken]) -> Self {
        let tokens = tokens.iter().map(|t| (t.token.clone(), t.clone())).collect();
        Self {
            manager,
            tokens: Arc::new(tokens),
        }
    }

    pub fn from_config(manager: Arc<RouteManager>, cfg: &Config) -> Self {
        Self::new(manager, &cfg.auth.tokens)
    }
}
