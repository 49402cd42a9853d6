// Package api provides the status controller.

use axum::{response::IntoResponse, routing::get, Json, Router};
use serde::Serialize;
use std::sync::Arc;
use sysinfo::System;

use crate::driver::Driver;
use crate::http::Controller;
use crate::server::ReadyGate;

#[derive(Debug, Serialize)]
pub struct Status {
    pub loadavg: [f64; 3],
    pub totalmem: u64,
    pub freemem: u64,
    pub driver: &'static str,
    pub accepting: bool,
}

/// StatusController reports host load and whether the server is accepting work.
pub struct StatusController {
    driver: Arc<Driver>,
    gate: ReadyGate,
}

impl StatusController {
    pub fn new(driver: Arc<Driver>, gate: ReadyGate) -> Self {
        Self { driver, gate }
    }

    fn status(driver: &Driver, gate: &ReadyGate) -> Status {
        let load = System::load_average();
        let mut sys = System::new();
        sys.refresh_memory();
        Status {
            loadavg: [load.one, load.five, load.fifteen],
            totalmem: sys.total_memory(),
            freemem: sys.free_memory(),
            driver: driver.name(),
            accepting: gate.is_ready(),
        }
    }
}

impl Controller for StatusController {
    fn add_route(&self, router: Router) -> Router {
        let driver = self.driver.clone();
        let gate = self.gate.clone();
        router.route(
            "/status",
            get(move || {
                let (driver, gate) = (driver.clone(), gate.clone());
                async move { Json(Self::status(&driver, &gate)).into_response() }
            }),
        )
    }
}
