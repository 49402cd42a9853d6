// Read-only view of the running configuration.

use axum::{extract::State, routing::get, Json, Router};
use serde_json::Value;
use std::sync::Arc;
use tracing::warn;

use crate::config::Config;
use crate::http::Controller;

/// Serves the effective configuration at `/central/config`. Secrets are
/// never serialized.
pub struct ShowConfigController {
    cfg: Arc<Config>,
}

impl ShowConfigController {
    pub fn new(cfg: Config) -> Self {
        Self { cfg: Arc::new(cfg) }
    }
}

async fn show_config(State(cfg): State<Arc<Config>>) -> Json<Value> {
    match serde_json::to_value(&*cfg) {
        Ok(value) => Json(value),
        Err(e) => {
            warn!(component = "config", event = "encode_failed", error = %e, "failed to encode config");
            Json(serde_json::json!({ "error": "failed to serialize config" }))
        }
    }
}

impl Controller for ShowConfigController {
    fn add_route(&self, router: Router) -> Router {
        let api = Router::new()
            .route("/central/config", get(show_config))
            .with_state(self.cfg.clone());
        router.merge(api)
    }
}
