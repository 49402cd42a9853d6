// Domain error types shared by the proxies, drivers and scheduler.

use crate::store::StoreError;

/// Errors produced while talking to remote agents or reconciling state.
#[derive(Debug, thiserror::Error)]
pub enum CentralError {
    #[error("executor {0} has not started")]
    ExecutorNotStarted(String),

    #[error("executor does not support requests")]
    RequestsNotSupported,

    #[error("not supported")]
    NotSupported,

    #[error("only one listener is supported for {0} events")]
    ListenerAlreadyAttached(&'static str),

    /// In-band `{error: msg}` reply from a remote agent.
    #[error("{0}")]
    Remote(String),

    #[error("unknown executor {0}")]
    UnknownExecutor(String),

    #[error("unknown instance {0}")]
    UnknownInstance(String),

    #[error("unknown gateway {0}")]
    UnknownGateway(String),

    #[error("unknown service {0}")]
    UnknownService(String),

    #[error("instance {0} already has a container")]
    DuplicateInstance(String),

    #[error("invalid deployment id")]
    InvalidDeployment,

    #[error("channel closed: {0}")]
    ChannelClosed(String),

    #[error("request timed out")]
    Timeout,

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("malformed message: {0}")]
    Protocol(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, CentralError>;
