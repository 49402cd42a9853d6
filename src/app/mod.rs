// Application wiring: configuration in, running server out.

pub mod app;
pub mod server;

pub use app::App;
