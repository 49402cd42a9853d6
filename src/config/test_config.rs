use super::{Api, CentralBox, Config, Control, Driver, Logs, Scheduler, Shutdown};
use std::time::Duration;

/// Creates a new test configuration.
pub fn new_test_config() -> Config {
    Config {
        central: CentralBox {
            env: super::TEST.to_string(),
            logs: Some(Logs {
                level: Some("debug".to_string()),
            }),
            api: Some(Api {
                name: Some("central:0".to_string()),
                port: Some(0),
                timeout: Some(Duration::from_secs(5)),
            }),
            base_dir: None,
            driver: Some(Driver {
                kind: Some("executor".to_string()),
                ..Driver::default()
            }),
            store: None,
            scheduler: Some(Scheduler {
                cluster_size: Some("1".to_string()),
                tracing: Some(false),
            }),
            control: Some(Control {
                request_timeout: Some(Duration::from_secs(2)),
                reconnect_timeout: Some(Duration::from_millis(200)),
            }),
            shutdown: Some(Shutdown {
                timeout: Some(Duration::from_secs(5)),
            }),
        },
    }
}
