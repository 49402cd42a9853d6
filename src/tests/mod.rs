//! Integration tests for Central.
//!
//! These cases serve the whole application on a local port and play the
//! remote agents over real websocket connections.

mod cases_operator_api_test;

pub mod support;
