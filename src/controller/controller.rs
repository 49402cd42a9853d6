// Route registration seam shared by HTTP controllers and control endpoints.

use axum::Router;

/// A set of routes mounted on the Central HTTP server. Websocket control
/// endpoints and plain HTTP controllers both implement it.
pub trait Controller: Send + Sync {
    /// Returns `router` with this controller's routes merged in.
    ///
    /// ```rust
    /// # use axum::{Router, routing::get};
    /// # async fn status() -> &'static str { "{}" }
    /// let router: Router<()> = Router::new().route("/status", get(status));
    /// # let _ = router;
    /// ```
    fn add_route(&self, router: Router) -> Router;
}
