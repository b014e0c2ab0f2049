//! Core type definitions for the plock coordination subsystem.
//!
//! This module contains the fundamental data types used throughout plockd:
//! lock operation descriptors, held-lock entries, and the per-resource
//! ownership state machine.
//!
//! # Type Aliases
//!
//! Common identifiers are defined as type aliases for clarity:
//!
//! - [`ResourceId`] = `u64`: lock-resource number (cluster-fs inode number)
//! - [`NodeId`] = `u32`: cluster node identifier
//! - [`OwnerTag`] = `u64`: identifies the requesting process's lock table
//! - [`GroupId`] = `u32`: mount group identifier (filesystem id)
//!
//! A lock's *lineage* is the pair `(NodeId, OwnerTag)`; entries of the same
//! lineage are merged and split against each other, while entries of
//! different lineages only ever conflict. The process id is carried for
//! reporting but is not part of lineage identity.

use serde::{Deserialize, Serialize};

/// Lock-resource number, derived from the cluster filesystem inode.
pub type ResourceId = u64;

/// Cluster node identifier.
pub type NodeId = u32;

/// Identifier of the requesting process's lock table.
pub type OwnerTag = u64;

/// Mount group identifier.
pub type GroupId = u32;

/// Kind of lock operation delivered by the kernel channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpKind {
    /// Acquire or convert a byte-range lock.
    Lock,
    /// Release a byte range.
    Unlock,
    /// Probe for a conflicting lock (fcntl GETLK).
    Get,
}

impl OpKind {
    /// Short tag used in log lines.
    pub fn tag(&self) -> &'static str {
        match self {
            OpKind::Lock => "LK",
            OpKind::Unlock => "UN",
            OpKind::Get => "GET",
        }
    }
}

/// One lock operation, as read from the kernel channel or carried in a
/// broadcast message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockOp {
    /// Operation kind.
    pub kind: OpKind,
    /// Resource the operation targets.
    pub number: ResourceId,
    /// First byte of the range, inclusive.
    pub start: u64,
    /// Last byte of the range, inclusive.
    pub end: u64,
    /// Exclusive (write) rather than shared (read) mode.
    pub exclusive: bool,
    /// Queue as a waiter on conflict instead of failing.
    pub wait: bool,
    /// Node the operation originated on.
    pub node: NodeId,
    /// Requesting process id.
    pub pid: u32,
    /// Requesting process's lock-table tag.
    pub owner: OwnerTag,
}

impl LockOp {
    /// Mode string for log lines.
    pub fn mode_tag(&self) -> &'static str {
        match self.kind {
            OpKind::Unlock | OpKind::Get => "-",
            OpKind::Lock if self.exclusive => "WR",
            OpKind::Lock => "RD",
        }
    }
}

/// Sync status of a lock or waiter entry during an ownership handover.
///
/// An entry is `Syncing` from the moment the relinquishing owner sends it
/// in a sync burst until the entry's own sync message is delivered back.
/// Syncing entries are excluded from checkpoints; the joining node receives
/// them through the live sync messages instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    /// Entry is stable and fully replicated.
    #[default]
    Clean,
    /// Entry was sent in a sync burst that has not been delivered yet.
    Syncing,
}

/// Per-resource ownership state.
///
/// Unowned resources have their lock state replicated on every member and
/// every operation broadcast; an owned resource's state lives only on the
/// owner, which applies operations locally without any messaging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OwnerState {
    /// No owner; state fully replicated. `acked` records whether this node
    /// has observed an "owner = 0" announcement for the resource, which is
    /// what distinguishes never-owned from relinquished and gates the drop
    /// handshake.
    Unowned { acked: bool },
    /// An ownership announcement is in flight; the owner is not yet known.
    Resolving,
    /// One node holds the lock state exclusively.
    Owned(NodeId),
}

impl OwnerState {
    /// True for either unowned variant.
    pub fn is_unowned(&self) -> bool {
        matches!(self, OwnerState::Unowned { .. })
    }

    /// True when this node is the owner.
    pub fn is_self(&self, node: NodeId) -> bool {
        *self == OwnerState::Owned(node)
    }
}

impl std::fmt::Display for OwnerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OwnerState::Unowned { acked: false } => write!(f, "0"),
            OwnerState::Unowned { acked: true } => write!(f, "0+"),
            OwnerState::Resolving => write!(f, "-1"),
            OwnerState::Owned(n) => write!(f, "{}", n),
        }
    }
}

/// One held byte-range lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PosixLock {
    /// First byte of the range, inclusive.
    pub start: u64,
    /// Last byte of the range, inclusive.
    pub end: u64,
    /// Exclusive (write) rather than shared (read) mode.
    pub exclusive: bool,
    /// Node the holder runs on.
    pub node: NodeId,
    /// Holder process id.
    pub pid: u32,
    /// Holder lock-table tag.
    pub owner: OwnerTag,
    /// Ownership-handover sync status.
    pub sync: SyncState,
}

impl PosixLock {
    /// True when `op` comes from the same lock lineage as this entry.
    pub fn same_lineage(&self, op: &LockOp) -> bool {
        self.node == op.node && self.owner == op.owner
    }

    /// True when this entry overlaps the inclusive range `[start, end]`.
    pub fn overlaps(&self, start: u64, end: u64) -> bool {
        !(self.end < start || self.start > end)
    }
}

/// A lock request deferred until its conflicts clear.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockWaiter {
    /// The deferred operation.
    pub op: LockOp,
    /// Ownership-handover sync status.
    pub sync: SyncState,
}

impl LockWaiter {
    pub fn new(op: LockOp) -> Self {
        Self {
            op,
            sync: SyncState::Clean,
        }
    }
}
