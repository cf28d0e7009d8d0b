//! tabrelay-server: many browser tabs attached to one shared remote terminal.
//!
//! Each tab gets a relay hub that owns the single upstream connection to the
//! tab's terminal resource and fans its output out to every attached client,
//! with a bounded replay buffer for late joiners.

pub mod auth;
pub mod config;
pub mod provision;
pub mod relay;
pub mod server;
pub mod session;
pub mod upstream;

pub use config::{CliOverrides, ServerConfig, UpstreamMode};
pub use provision::{ProvisionState, ProvisioningCoordinator};
pub use relay::{HubRegistry, RelayHub, TabKey};
pub use server::RelayServer;
pub use session::SessionRegistry;
pub use upstream::{TerminalResource, UpstreamConnection};
