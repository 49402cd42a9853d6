// A full Central application served on an ephemeral local port.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::app::App;
use crate::config::{self, Config};

pub struct CentralServer {
    app: App,
    addr: SocketAddr,
    serving: JoinHandle<anyhow::Result<()>>,
    base: tempfile::TempDir,
}

impl CentralServer {
    /// Starts the application with the test config.
    pub async fn start() -> Self {
        Self::start_with(config::new_test_config()).await
    }

    pub async fn start_with(mut cfg: Config) -> Self {
        let base = tempfile::tempdir().expect("base dir");
        cfg.set_base_dir(base.path().to_path_buf());

        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");
        let app = App::new(CancellationToken::new(), cfg).await.expect("app");

        let serving = {
            let app = app.clone();
            tokio::spawn(async move { app.serve_on(listener).await })
        };
        tokio::time::timeout(Duration::from_secs(5), app.central().gate().wait())
            .await
            .expect("central did not become ready");

        Self {
            app,
            addr,
            serving,
            base,
        }
    }

    pub fn app(&self) -> &App {
        &self.app
    }

    pub fn base_dir(&self) -> &std::path::Path {
        self.base.path()
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn ws_url(&self, path: &str) -> String {
        format!("ws://{}{}", self.addr, path)
    }

    /// Closes every proxy and waits for the HTTP server to stop.
    pub async fn stop(self) {
        self.app.close().await;
        let _ = tokio::time::timeout(Duration::from_secs(5), self.serving).await;
    }
}
