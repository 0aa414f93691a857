//! VLESS Manager Core Library
//!
//! This crate owns the control plane of a VLESS-over-websocket VPN server:
//! client identities, the sing-box server and client documents derived from
//! them, self-signed TLS material, and supervision of the sing-box process.

pub mod config;
pub mod config_builder;
pub mod documents;
pub mod error;
pub mod manager;
pub mod model;
pub mod share_link;
pub mod store;
pub mod supervisor;
pub mod tls;

pub use config::{GlobalConfig, StateLayout, CONFIG_PLACEHOLDER, CONFIG_VERSION};
pub use config_builder::{resolve_endpoint, route_exclude_cidrs, ConfigBuilder};
pub use documents::{ClientDocument, ServerDocument};
pub use error::{Error, Result};
pub use manager::StateManager;
pub use model::*;
pub use share_link::ShareLink;
pub use store::ClientStore;
pub use supervisor::{ExitReport, ProcessState, ProcessSupervisor, StartOutcome, StopOutcome};
