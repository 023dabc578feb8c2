//! Tether: a short-range device mesh coordinator.
//!
//! Applications spread across physically paired devices discover each other
//! over two radio transports, hold bidirectional links, exchange structured
//! envelopes and keep a shared app-registry/measurement data set loosely
//! synchronized. The crate is radio-agnostic: platform integration happens
//! behind the [`transport::Radio`] trait, persistence behind
//! [`store::DataStore`], and an in-process implementation of each ships
//! in-tree for testing and development.
//!
//! Entry point: [`coordinator::MeshCoordinator::start`], then
//! [`bind`](coordinator::MeshCoordinator::bind) one session per local app.

pub mod config;
pub mod connection;
pub mod coordinator;
pub mod discovery;
pub mod error;
pub mod events;
pub mod protocol;
pub mod registry;
pub mod router;
pub mod session;
pub mod store;
pub mod sync;
pub mod transport;

pub use config::MeshConfig;
pub use coordinator::MeshCoordinator;
pub use error::{Error, Result};
pub use events::MeshEvent;
pub use protocol::{AppId, DeviceAddress, Envelope};
pub use registry::{Device, DeviceRole, TransportCapability};
pub use session::SessionHandle;
pub use transport::{TransportKind, TransportPreference};
