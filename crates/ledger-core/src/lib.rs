//! ledger-core: shared state and wire types for tracking who has which
//! project open across a LAN.
//!
//! This crate provides:
//! - The checkout ledger (project ownership, conflict detection, activity)
//! - The peer roster with AWOL/eviction state
//! - JSON protocol types exchanged between client and server roles
//! - Capability traits for platform collaborators, with in-memory fakes

pub mod ledger;
pub mod protocol;
pub mod roster;
pub mod sources;

pub use ledger::{Checkout, Deregistered, Ledger, LedgerError, Project, SnapshotOutcome};
pub use protocol::{
    ActivityUpdate, CheckoutResponse, ClientSnapshot, ErrorBody, OpenProject, OpenProjects, Pong,
    ProjectInfo, UpdateAccepted,
};
pub use roster::{AwolTransition, DEFAULT_GRACE_PERIOD, Peer, Roster};
pub use sources::{
    ActivityEvent, ActivitySource, IdleProbe, OpenProjectsSource, ProjectResolver, SourceError,
};
