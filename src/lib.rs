#[cfg(test)]
mod tests;

#[cfg(test)]
pub use tests::support;

pub mod app;
pub mod channel;
pub mod config;
pub mod controller;
pub mod driver;
pub mod error;
pub mod events;
pub mod gateway;
pub mod http;
pub mod recorder;
pub mod scheduler;
pub mod server;
pub mod shutdown;
pub mod store;
