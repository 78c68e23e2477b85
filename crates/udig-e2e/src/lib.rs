//! End-to-end test utilities for udig
//!
//! Runs a complete broker in-process on ephemeral ports, with generated
//! certificates, so links and public clients can be tested against it
//! over real sockets.

pub mod certificates;
pub mod harness;
pub mod mock_tcp_service;
pub mod test_link;

pub use certificates::TestCertificates;
pub use harness::{TestBroker, TEST_DOMAIN};
pub use mock_tcp_service::{MockTcpService, TcpServiceMode};
pub use test_link::TestLink;
