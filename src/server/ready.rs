// Startup phase of the server; hooks wait until reconnection has finished.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Phase {
    Uninitialized,
    Reconnecting,
    Ready,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Uninitialized => "uninitialized",
            Self::Reconnecting => "reconnecting",
            Self::Ready => "ready",
        }
    }
}

/// Shared, cloneable view of the server phase.
#[derive(Clone)]
pub struct ReadyGate {
    tx: Arc<watch::Sender<Phase>>,
}

impl Default for ReadyGate {
    fn default() -> Self {
        Self::new()
    }
}

impl ReadyGate {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(Phase::Uninitialized);
        Self { tx: Arc::new(tx) }
    }

    /// A gate that is already open.
    pub fn ready() -> Self {
        let gate = Self::new();
        gate.set(Phase::Ready);
        gate
    }

    pub fn phase(&self) -> Phase {
        *self.tx.borrow()
    }

    pub fn is_ready(&self) -> bool {
        self.phase() == Phase::Ready
    }

    pub fn set(&self, phase: Phase) {
        info!(component = "server", event = "phase", phase = phase.as_str(), "server phase changed");
        self.tx.send_replace(phase);
    }

    /// Resolves once the phase reaches [`Phase::Ready`].
    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives as long as `self`, so this cannot fail.
        let _ = rx.wait_for(|phase| *phase == Phase::Ready).await;
    }
}
