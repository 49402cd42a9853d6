//! Gateways and the driver that tracks them.

pub mod gateway;


use std::collections::HashMap;
use std::sync::Arc;

use futures::future::join_all;
use parking_lot::RwLock;
use tracing::{info, warn};

use crate::channel::Router;
use crate::error::{CentralError, Result};
use crate::events::{AgentEvents, ServiceEndpoints};

pub use gateway::{Gateway, GatewayListener};

/// Pushes the full endpoint map to a gateway when it starts.
struct Resync {
    events: Arc<dyn AgentEvents>,
}

#[async_trait::async_trait]
impl GatewayListener for Resync {
    async fn resync(&self, gateway: &Gateway) -> Result<()> {
        let endpoints = self.events.service_endpoints().await?;
        info!(component = "gateway", event = "resync", gateway_id = %gateway.id(), services = endpoints.len(), "syncing gateway");
        gateway.sync(&endpoints).await
    }
}

pub struct GatewayDriver {
    router: Arc<dyn Router>,
    events: Arc<dyn AgentEvents>,
    gateways: RwLock<HashMap<String, Arc<Gateway>>>,
}

impl GatewayDriver {
    pub fn new(router: Arc<dyn Router>, events: Arc<dyn AgentEvents>) -> Self {
        Self {
            router,
            events,
            gateways: RwLock::new(HashMap::new()),
        }
    }

    pub fn gateway(&self, id: &str) -> Option<Arc<Gateway>> {
        self.gateways.read().get(id).cloned()
    }

    /// Builds the proxy for a gateway and returns its token.
    pub async fn create_gateway(&self, id: &str, token: Option<String>) -> Result<String> {
        let gateway = Gateway::new(id, token, self.router.clone());
        gateway.attach(Arc::new(Resync {
            events: self.events.clone(),
        }))?;
        let token = gateway.listen();
        let previous = self.gateways.write().insert(id.to_string(), gateway);
        if let Some(previous) = previous {
            warn!(component = "gateway", event = "gateway_replaced", gateway_id = id, "closing previous gateway proxy");
            previous.close().await?;
        }
        info!(component = "gateway", event = "gateway_created", gateway_id = id, "gateway proxy created");
        Ok(token)
    }

    pub async fn destroy_gateway(&self, id: &str) -> Result<()> {
        let gateway = self.gateways.write().remove(id);
        match gateway {
            Some(gateway) => gateway.close().await,
            None => Ok(()),
        }
    }

    /// Full sync of one gateway.
    pub async fn update_gateway(&self, id: &str, endpoints: &[ServiceEndpoints]) -> Result<()> {
        let gateway = self
            .gateway(id)
            .ok_or_else(|| CentralError::UnknownGateway(id.to_string()))?;
        gateway.sync(endpoints).await
    }

    /// Incremental update of every gateway.
    pub async fn update_gateways(&self, endpoints: &[ServiceEndpoints]) -> Result<()> {
        let gateways: Vec<_> = self.gateways.read().values().cloned().collect();
        for res in join_all(gateways.iter().map(|g| g.update(endpoints))).await {
            res?;
        }
        Ok(())
    }

    pub async fn stop(&self) -> Result<()> {
        let gateways: Vec<_> = self.gateways.write().drain().map(|(_, g)| g).collect();
        for res in join_all(gateways.iter().map(|g| g.close())).await {
            res?;
        }
        Ok(())
    }
}
