//! Bulk lock-state transfer through the external checkpoint service.
//!
//! A node joining a mount group receives the group's current lock state
//! from a replicated, sectioned snapshot written by the lowest-numbered
//! surviving member. One section per resource, named for the resource
//! number and recorded owner; the payload is a flat array of packed,
//! little-endian lock/waiter records.
//!
//! Entries still mid-sync from an ownership handover are excluded: the
//! joiner receives those through the live sync messages, and including them
//! here would duplicate them. Calls into the service that fail with its
//! transient busy indication are retried indefinitely with a short
//! cooperative backoff; anything else aborts the attempt with an error log,
//! leaving the joiner without full visibility until the next store cycle.

use crate::group::MountGroup;
use crate::resource::Resource;
use crate::types::{LockWaiter, NodeId, OwnerState, PosixLock, ResourceId, SyncState};
use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, error, info};

/// Error surface of the external checkpoint service.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SnapshotError {
    /// Transient; the call should be retried shortly.
    #[error("snapshot service busy")]
    Busy,
    /// A checkpoint or section with this name already exists.
    #[error("snapshot already exists")]
    Exists,
    /// No checkpoint with this name.
    #[error("snapshot not found")]
    Missing,
    /// Terminal failure.
    #[error("snapshot service error: {0}")]
    Failed(String),
}

/// Sizing attributes declared when creating a checkpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SnapshotAttrs {
    /// Number of sections that will be written.
    pub section_count: usize,
    /// Largest single section payload in bytes.
    pub max_section_len: usize,
    /// Total payload across all sections in bytes.
    pub total_len: usize,
}

/// The replicated, sectioned snapshot facility consumed for state transfer.
///
/// Implementations may return [`SnapshotError::Busy`] from any call to
/// signal transient overload; callers retry with backoff. `unlink` of a
/// missing checkpoint is not an error.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Create an empty checkpoint with the given sizing attributes.
    async fn create(&self, name: &str, attrs: SnapshotAttrs) -> Result<(), SnapshotError>;

    /// Remove a checkpoint and all its sections.
    async fn unlink(&self, name: &str) -> Result<(), SnapshotError>;

    /// Add one section to an existing checkpoint.
    async fn write_section(&self, name: &str, id: &str, data: &[u8])
        -> Result<(), SnapshotError>;

    /// List the section ids of a checkpoint.
    async fn sections(&self, name: &str) -> Result<Vec<String>, SnapshotError>;

    /// Read one section's payload.
    async fn read_section(&self, name: &str, id: &str) -> Result<Vec<u8>, SnapshotError>;
}

const RETRY_BASE: Duration = Duration::from_millis(100);
const RETRY_MAX: Duration = Duration::from_secs(1);

/// Run a snapshot-service call, retrying its busy indication indefinitely
/// with bounded exponential backoff. The sleep is cooperative, so other
/// groups serviced by the same process keep making progress.
pub async fn retry_busy<T, F, Fut>(what: &str, mut call: F) -> Result<T, SnapshotError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, SnapshotError>>,
{
    let mut delay = RETRY_BASE;
    loop {
        match call().await {
            Err(SnapshotError::Busy) => {
                debug!(call = what, delay_ms = delay.as_millis() as u64, "snapshot busy, retrying");
                sleep(delay).await;
                delay = (delay * 2).min(RETRY_MAX);
            }
            other => return other,
        }
    }
}

/// One packed lock or waiter record in a section payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PackedEntry {
    pub start: u64,
    pub end: u64,
    pub owner: u64,
    pub pid: u32,
    pub node: u32,
    pub exclusive: bool,
    pub waiter: bool,
}

impl PackedEntry {
    /// Encoded length in bytes.
    pub const LEN: usize = 40;

    /// Encode to the little-endian packed layout.
    pub fn encode(&self) -> [u8; Self::LEN] {
        let mut buf = [0u8; Self::LEN];
        buf[0..8].copy_from_slice(&self.start.to_le_bytes());
        buf[8..16].copy_from_slice(&self.end.to_le_bytes());
        buf[16..24].copy_from_slice(&self.owner.to_le_bytes());
        buf[24..28].copy_from_slice(&self.pid.to_le_bytes());
        buf[28..32].copy_from_slice(&self.node.to_le_bytes());
        buf[32] = self.exclusive as u8;
        buf[33] = self.waiter as u8;
        buf
    }

    /// Decode from the little-endian packed layout.
    pub fn decode(buf: &[u8]) -> Self {
        Self {
            start: u64::from_le_bytes(buf[0..8].try_into().unwrap()),
            end: u64::from_le_bytes(buf[8..16].try_into().unwrap()),
            owner: u64::from_le_bytes(buf[16..24].try_into().unwrap()),
            pid: u32::from_le_bytes(buf[24..28].try_into().unwrap()),
            node: u32::from_le_bytes(buf[28..32].try_into().unwrap()),
            exclusive: buf[32] != 0,
            waiter: buf[33] != 0,
        }
    }
}

/// Section name for a resource: `r<number>.<owner>` under the ownership
/// model, `r<number>` without it.
fn section_name(number: ResourceId, owner: NodeId, ownership: bool) -> String {
    if ownership {
        format!("r{}.{}", number, owner)
    } else {
        format!("r{}", number)
    }
}

/// Parse a section name back into resource number and owner.
fn parse_section_name(id: &str, ownership: bool) -> Option<(ResourceId, NodeId)> {
    let rest = id.strip_prefix('r')?;
    if ownership {
        let (num, owner) = rest.split_once('.')?;
        Some((num.parse().ok()?, owner.parse().ok()?))
    } else {
        Some((rest.parse().ok()?, 0))
    }
}

/// The owner recorded for a resource in the checkpoint.
///
/// A resource this node owns, or has just unowned without the relinquish
/// echo yet, is recorded as owned by this node: the joiner must not treat
/// its state as replicated until the handover completes. Only a resource
/// whose unown is acknowledged is recorded as unowned.
fn checkpoint_owner(r: &Resource, self_node: NodeId) -> NodeId {
    match r.owner {
        OwnerState::Owned(n) => n,
        OwnerState::Unowned { acked: false } => self_node,
        OwnerState::Unowned { acked: true } => 0,
        OwnerState::Resolving => unreachable!("resolving resources are skipped"),
    }
}

/// Pack one resource into its section, or `None` for resources that do not
/// belong in the checkpoint.
fn pack_resource(r: &Resource, self_node: NodeId, ownership: bool) -> Option<(String, Vec<u8>)> {
    if r.owner == OwnerState::Resolving {
        return None;
    }
    let owner = checkpoint_owner(r, self_node);
    let name = section_name(r.number, owner, ownership);

    // plocks on a resource we own are not replicated on other nodes, so
    // the section carries the owner alone
    if r.owner.is_self(self_node) {
        return Some((name, Vec::new()));
    }

    let mut data = Vec::with_capacity((r.locks.len() + r.waiters.len()) * PackedEntry::LEN);
    for po in &r.locks {
        if po.sync == SyncState::Syncing {
            continue;
        }
        data.extend_from_slice(&PackedEntry {
            start: po.start,
            end: po.end,
            owner: po.owner,
            pid: po.pid,
            node: po.node,
            exclusive: po.exclusive,
            waiter: false,
        }
        .encode());
    }
    for w in &r.waiters {
        if w.sync == SyncState::Syncing {
            continue;
        }
        data.extend_from_slice(&PackedEntry {
            start: w.op.start,
            end: w.op.end,
            owner: w.op.owner,
            pid: w.op.pid,
            node: w.op.node,
            exclusive: w.op.exclusive,
            waiter: true,
        }
        .encode());
    }
    Some((name, data))
}

/// Pack a group's whole resource table into checkpoint sections.
pub fn pack_group(group: &MountGroup) -> Vec<(String, Vec<u8>)> {
    let self_node = group.node_id();
    let ownership = group.table.ownership();
    group
        .table
        .iter()
        .filter_map(|r| pack_resource(r, self_node, ownership))
        .collect()
}

/// Unpack one section into a fresh resource.
pub fn unpack_section(id: &str, data: &[u8], ownership: bool) -> Option<Resource> {
    let (number, owner) = parse_section_name(id, ownership)?;
    if data.len() % PackedEntry::LEN != 0 {
        return None;
    }

    let owner = if owner == 0 {
        OwnerState::Unowned { acked: false }
    } else {
        OwnerState::Owned(owner)
    };
    let mut r = Resource::new(number, owner);

    for chunk in data.chunks_exact(PackedEntry::LEN) {
        let entry = PackedEntry::decode(chunk);
        if entry.waiter {
            r.waiters.push(LockWaiter::new(crate::types::LockOp {
                kind: crate::types::OpKind::Lock,
                number,
                start: entry.start,
                end: entry.end,
                exclusive: entry.exclusive,
                wait: true,
                node: entry.node,
                pid: entry.pid,
                owner: entry.owner,
            }));
        } else {
            r.locks.push(PosixLock {
                start: entry.start,
                end: entry.end,
                exclusive: entry.exclusive,
                node: entry.node,
                pid: entry.pid,
                owner: entry.owner,
                sync: SyncState::Clean,
            });
        }
    }
    Some(r)
}

/// Store packed sections as the group's checkpoint, replacing any prior one.
///
/// At most one checkpoint exists per group at a time; a stale checkpoint
/// left by a failed master is unlinked first. A section-exists surprise
/// means another stale copy raced in, so the whole checkpoint is rebuilt
/// once.
pub async fn store_locks(
    store: &dyn SnapshotStore,
    name: &str,
    sections: &[(String, Vec<u8>)],
) -> Result<(), SnapshotError> {
    let attrs = SnapshotAttrs {
        section_count: sections.len(),
        max_section_len: sections.iter().map(|(_, d)| d.len()).max().unwrap_or(0),
        total_len: sections.iter().map(|(_, d)| d.len()).sum(),
    };

    info!(
        checkpoint = name,
        sections = attrs.section_count,
        bytes = attrs.total_len,
        "storing lock state"
    );

    for attempt in 0..2 {
        retry_busy("unlink", || store.unlink(name)).await?;

        match retry_busy("create", || store.create(name, attrs)).await {
            Ok(()) => {}
            Err(SnapshotError::Exists) => {
                debug!(checkpoint = name, "checkpoint already exists");
                return Ok(());
            }
            Err(e) => return Err(e),
        }

        let mut clashed = false;
        for (id, data) in sections {
            match retry_busy("write_section", || store.write_section(name, id, data)).await {
                Ok(()) => {}
                Err(SnapshotError::Exists) if attempt == 0 => {
                    debug!(checkpoint = name, section = %id, "clearing stale checkpoint");
                    clashed = true;
                    break;
                }
                Err(e) => return Err(e),
            }
        }
        if !clashed {
            return Ok(());
        }
    }

    Err(SnapshotError::Failed("checkpoint rebuild failed".into()))
}

/// Retrieve a group's checkpoint into fresh resources.
///
/// Sections with a malformed name or a payload that is not a whole number
/// of records are logged and skipped. When `unlink_after` is set (this node
/// is the new master) the checkpoint is removed once read, so a fresh one
/// can be created for the next joiner.
pub async fn retrieve_locks(
    store: &dyn SnapshotStore,
    name: &str,
    ownership: bool,
    unlink_after: bool,
) -> Result<Vec<Resource>, SnapshotError> {
    info!(checkpoint = name, "retrieving lock state");

    let ids = retry_busy("sections", || store.sections(name)).await?;

    let mut resources = Vec::with_capacity(ids.len());
    for id in &ids {
        let data = retry_busy("read_section", || store.read_section(name, id)).await?;
        match unpack_section(id, &data, ownership) {
            Some(r) => {
                debug!(
                    checkpoint = name,
                    section = %id,
                    bytes = data.len(),
                    "read section"
                );
                resources.push(r);
            }
            None => {
                error!(checkpoint = name, section = %id, len = data.len(), "bad section");
            }
        }
    }

    if unlink_after {
        debug!(checkpoint = name, "unlinking checkpoint from old master");
        retry_busy("unlink", || store.unlink(name)).await?;
    }

    Ok(resources)
}
