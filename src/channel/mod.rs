//! Control channel transport contract.
//!
//! Central never opens connections itself. A [`Router`] accepts a client
//! registration for a token, and each time the remote agent connects (or
//! reconnects) the client hands a fresh [`Channel`] to whoever subscribed via
//! [`Client::on_new_channel`]. Inbound requests and notifications are routed to
//! the [`RequestHandler`] supplied at registration.

pub mod message;
pub mod ws;


use std::sync::Arc;

use crate::error::Result;

pub use message::{check_response, cmd_of, error_reply, new_token, ok_reply, Message};
pub use ws::WsRouter;

/// Invoked with every new channel a client receives.
pub type ChannelHandler = Arc<dyn Fn(Arc<dyn Channel>) + Send + Sync>;

/// Invoked with the transport error text when a channel fails.
pub type ErrorHandler = Arc<dyn Fn(&str) + Send + Sync>;

/// Receives requests initiated by the remote agent.
#[async_trait::async_trait]
pub trait RequestHandler: Send + Sync {
    /// Handles one inbound request and produces the reply body.
    async fn on_request(&self, msg: Message) -> Message;
}

/// One live connection to a remote agent.
#[async_trait::async_trait]
pub trait Channel: Send + Sync {
    /// Token the agent authenticated with.
    fn token(&self) -> String;

    /// Sends a request and waits for the agent's reply.
    ///
    /// Only transport failures are returned as errors; in-band
    /// `{error: ...}` replies come back as a normal message.
    async fn request(&self, msg: Message) -> Result<Message>;

    /// Sends a message without waiting for a reply.
    fn notify(&self, msg: Message);

    /// Subscribes to transport errors on this channel.
    fn on_error(&self, handler: ErrorHandler);

    /// Closes the channel. No error handlers fire for an explicit close.
    fn close(&self, reason: Option<&str>);
}

/// A registration for one agent token.
#[async_trait::async_trait]
pub trait Client: Send + Sync {
    fn token(&self) -> String;

    /// Subscribes to channel (re)connections.
    fn on_new_channel(&self, handler: ChannelHandler);

    /// Drops the registration and closes the active channel, if any.
    async fn close(&self) -> Result<()>;
}

/// Accepts client registrations for one control endpoint.
pub trait Router: Send + Sync {
    /// Endpoint path, e.g. `executor-control`.
    fn path(&self) -> &str;

    /// Registers a client. When `token` is `None` a new one is allocated.
    fn accept_client(&self, handler: Arc<dyn RequestHandler>, token: Option<String>) -> Arc<dyn Client>;
}

/// Whether two handles point at the same channel.
pub fn same_channel(a: &Arc<dyn Channel>, b: &Arc<dyn Channel>) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}

/// The three routers a running server needs.
#[derive(Clone)]
pub struct Routers {
    pub executor: Arc<dyn Router>,
    pub instance: Arc<dyn Router>,
    pub gateway: Arc<dyn Router>,
}
