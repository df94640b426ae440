//! ledger-daemon library: the native pieces behind the `ledger-daemon` binary.
//!
//! Exposed as a library so integration tests can drive the roles directly.

pub mod bundle;
pub mod client;
pub mod config;
pub mod discovery;
pub mod health;
pub mod idle;
pub mod projects;
pub mod routes;
pub mod server;
pub mod transport;
pub mod watcher;

// Re-export key types for convenience
pub use bundle::BundleResolver;
pub use client::{ClientEvent, ClientRole, ClientSources};
pub use config::{Config, Role, Timings};
pub use discovery::{DiscoveredService, DiscoveryError, MemberValidator, Membership, RosterChanged};
pub use health::{BroadcastSummary, Broadcaster, EvictionHook, SharedRoster};
pub use projects::LsofProjects;
pub use routes::CommonState;
pub use server::ServerState;
pub use transport::{HttpTransport, Payload, TransportError};
pub use watcher::FileWatcher;
