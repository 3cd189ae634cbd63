//! # Test Support - Mock Collaborators
//!
//! In-crate mock implementations of the external collaborators (backend
//! provider, container endpoint, physical XA resource) with scriptable
//! behavior and call recording. Shared by unit tests and the integration
//! tests under `tests/`.

pub mod broker;
pub mod endpoint;
pub mod factories;
pub mod xa;

pub use broker::{MockBroker, MockConnectionFactory, MockResolver};
pub use endpoint::{EndpointInvocation, MockEndpointFactory};
pub use factories::CountingResourceFactory;
pub use xa::{RecordedXaCall, RecordingXaResource};
