// Shared test support: an in-memory transport playing the remote agents, a
// served application harness and small helpers for waiting on spawned work.

pub mod common;
pub mod events;
pub mod harness;
pub mod transport;

use std::sync::Arc;
use std::time::Duration;

pub use common::{do_json, do_request, H};
pub use events::RecordingEvents;
pub use harness::CentralServer;
pub use transport::{MemoryChannel, MemoryClient, MemoryRouter};

use crate::channel::Routers;

/// The three in-memory routers a server needs, kept typed for inspection.
pub struct TestRouters {
    pub executor: Arc<MemoryRouter>,
    pub instance: Arc<MemoryRouter>,
    pub gateway: Arc<MemoryRouter>,
}

impl TestRouters {
    pub fn new() -> Self {
        Self {
            executor: MemoryRouter::new("executor-control"),
            instance: MemoryRouter::new("supervisor-control"),
            gateway: MemoryRouter::new("gateway-control"),
        }
    }

    pub fn routers(&self) -> Routers {
        Routers {
            executor: self.executor.clone(),
            instance: self.instance.clone(),
            gateway: self.gateway.clone(),
        }
    }
}

/// Polls `cond` until it holds, failing the test after two seconds.
pub async fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !cond() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
