//! End-to-end test utilities for the Sluice tunnel system
//!
//! Starts a complete in-process server (control upgrades, HTTP plane, TCP
//! plane) backed by an in-memory token store, plus mock local services and
//! a link that can drop every client connection on demand.

pub mod flaky_link;
pub mod harness;
pub mod mock_service;
pub mod mock_tcp_service;
pub mod test_client;

pub use flaky_link::FlakyLink;
pub use harness::{TestServer, TestServerOptions};
pub use mock_service::MockHttpService;
pub use mock_tcp_service::{MockTcpService, TcpServiceMode};
pub use test_client::{http_options, TestClient};
