//! plockd - distributed POSIX byte-range lock coordination for cluster
//! file systems.
//!
//! Every node mounting a shared cluster filesystem runs one plockd
//! instance. Advisory byte-range locks (fcntl plocks) taken on any node
//! are replicated so that all nodes observe the same lock state, with a
//! per-resource ownership optimization that lets a single busy node apply
//! its operations locally without any messaging.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         plockd                              │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Kernel Channel: lock requests in | results out             │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Event Loop: one consumer per process (daemon)              │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Mount Groups: resource table | lock engine | ownership     │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Cluster Services: broadcast transport | membership |       │
//! │                    checkpoint snapshots                     │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Correctness rests on the broadcast transport's total-order delivery:
//! operations against unowned resources are broadcast and applied by a
//! deterministic engine on every member, so identical inputs yield
//! identical lock state everywhere. Membership changes arrive through the
//! same ordered stream, and each member purges a failed node's locks at
//! the same point in that stream. New members bulk-load lock state from a
//! replicated checkpoint written by the lowest surviving node.

pub mod config;
pub mod error;
pub mod types;

pub mod checkpoint;
pub mod daemon;
pub mod engine;
pub mod group;
pub mod kernel;
pub mod observability;
pub mod proto;
pub mod recovery;
pub mod resource;
pub mod transport;

// Re-exports
pub use config::PlockConfig;
pub use daemon::{BusEvent, Daemon};
pub use error::{PlockError, Result};
pub use group::{JoinPhase, MountGroup};
pub use recovery::MembershipEvent;
pub use types::*;
