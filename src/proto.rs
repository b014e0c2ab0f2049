//! Inter-node wire protocol.
//!
//! Every plock-class message shares one fixed layout: a 32-byte header
//! followed by one 64-byte packed operation record. All multi-byte fields
//! are little-endian on the wire and normalized on encode/decode, so a
//! mixed-endian cluster converges on identical state.
//!
//! Message kinds:
//!
//! - [`MsgKind::Plock`]: one lock/unlock operation, applied deterministically
//!   by every member.
//! - [`MsgKind::Own`]: ownership announcement; the record's `node` field
//!   carries the proposed owner (0 = relinquish).
//! - [`MsgKind::Drop`]: request to free an idle unowned resource; only the
//!   record's `number` is meaningful.
//! - [`MsgKind::SyncLock`] / [`MsgKind::SyncWaiter`]: one lock or waiter
//!   entry, sent by a relinquishing owner as an authoritative snapshot.

use crate::error::{PlockError, Result};
use crate::types::{GroupId, LockOp, NodeId, OpKind, PosixLock, ResourceId};

/// Wire protocol version; the major component must match on receive.
pub const PROTO_VERSION: [u16; 3] = [1, 0, 0];

/// Operation record format version.
pub const RECORD_VERSION: [u32; 3] = [1, 0, 0];

/// Kind of an inter-node plock message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgKind {
    /// One replicated lock/unlock operation.
    Plock,
    /// Ownership announcement.
    Own,
    /// Drop an idle unowned resource.
    Drop,
    /// One lock entry from a relinquishing owner.
    SyncLock,
    /// One waiter entry from a relinquishing owner.
    SyncWaiter,
}

impl MsgKind {
    fn to_wire(self) -> u8 {
        match self {
            MsgKind::Plock => 1,
            MsgKind::Own => 2,
            MsgKind::Drop => 3,
            MsgKind::SyncLock => 4,
            MsgKind::SyncWaiter => 5,
        }
    }

    fn from_wire(v: u8) -> Result<Self> {
        match v {
            1 => Ok(MsgKind::Plock),
            2 => Ok(MsgKind::Own),
            3 => Ok(MsgKind::Drop),
            4 => Ok(MsgKind::SyncLock),
            5 => Ok(MsgKind::SyncWaiter),
            other => Err(PlockError::InvalidMessageKind(other)),
        }
    }

    /// Static tag for metrics labels.
    pub fn tag(&self) -> &'static str {
        match self {
            MsgKind::Plock => "plock",
            MsgKind::Own => "own",
            MsgKind::Drop => "drop",
            MsgKind::SyncLock => "sync_lock",
            MsgKind::SyncWaiter => "sync_waiter",
        }
    }
}

/// Packed lock-operation record, shared by the kernel channel and the wire.
///
/// 64 bytes, little-endian. The kernel writes requests in this layout and
/// expects results back in it; inter-node messages embed one record after
/// the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OpRecord {
    pub version: [u32; 3],
    pub optype: u8,
    pub ex: u8,
    pub wait: u8,
    pub pid: u32,
    pub node: u32,
    pub rv: i32,
    pub fsid: u32,
    pub number: u64,
    pub start: u64,
    pub end: u64,
    pub owner: u64,
}

/// Raw optype values in an [`OpRecord`].
const OPTYPE_LOCK: u8 = 1;
const OPTYPE_UNLOCK: u8 = 2;
const OPTYPE_GET: u8 = 3;

impl OpRecord {
    /// Encoded length in bytes.
    pub const LEN: usize = 64;

    /// Encode to the little-endian wire layout.
    pub fn encode(&self) -> [u8; Self::LEN] {
        let mut buf = [0u8; Self::LEN];
        buf[0..4].copy_from_slice(&self.version[0].to_le_bytes());
        buf[4..8].copy_from_slice(&self.version[1].to_le_bytes());
        buf[8..12].copy_from_slice(&self.version[2].to_le_bytes());
        buf[12] = self.optype;
        buf[13] = self.ex;
        buf[14] = self.wait;
        buf[16..20].copy_from_slice(&self.pid.to_le_bytes());
        buf[20..24].copy_from_slice(&self.node.to_le_bytes());
        buf[24..28].copy_from_slice(&self.rv.to_le_bytes());
        buf[28..32].copy_from_slice(&self.fsid.to_le_bytes());
        buf[32..40].copy_from_slice(&self.number.to_le_bytes());
        buf[40..48].copy_from_slice(&self.start.to_le_bytes());
        buf[48..56].copy_from_slice(&self.end.to_le_bytes());
        buf[56..64].copy_from_slice(&self.owner.to_le_bytes());
        buf
    }

    /// Decode from the little-endian wire layout.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < Self::LEN {
            return Err(PlockError::ShortMessage {
                got: buf.len(),
                need: Self::LEN,
            });
        }
        let u32_at = |o: usize| u32::from_le_bytes(buf[o..o + 4].try_into().unwrap());
        let u64_at = |o: usize| u64::from_le_bytes(buf[o..o + 8].try_into().unwrap());
        Ok(Self {
            version: [u32_at(0), u32_at(4), u32_at(8)],
            optype: buf[12],
            ex: buf[13],
            wait: buf[14],
            pid: u32_at(16),
            node: u32_at(20),
            rv: i32::from_le_bytes(buf[24..28].try_into().unwrap()),
            fsid: u32_at(28),
            number: u64_at(32),
            start: u64_at(40),
            end: u64_at(48),
            owner: u64_at(56),
        })
    }

    /// Build a record from an operation descriptor.
    pub fn from_op(fsid: GroupId, op: &LockOp, rv: i32) -> Self {
        let optype = match op.kind {
            OpKind::Lock => OPTYPE_LOCK,
            OpKind::Unlock => OPTYPE_UNLOCK,
            OpKind::Get => OPTYPE_GET,
        };
        Self {
            version: RECORD_VERSION,
            optype,
            ex: op.exclusive as u8,
            wait: op.wait as u8,
            pid: op.pid,
            node: op.node,
            rv,
            fsid,
            number: op.number,
            start: op.start,
            end: op.end,
            owner: op.owner,
        }
    }

    /// Interpret the record as an operation descriptor.
    pub fn to_op(&self) -> Result<LockOp> {
        let kind = match self.optype {
            OPTYPE_LOCK => OpKind::Lock,
            OPTYPE_UNLOCK => OpKind::Unlock,
            OPTYPE_GET => OpKind::Get,
            other => return Err(PlockError::InvalidOpType(other)),
        };
        Ok(LockOp {
            kind,
            number: self.number,
            start: self.start,
            end: self.end,
            exclusive: self.ex != 0,
            wait: self.wait != 0,
            node: self.node,
            pid: self.pid,
            owner: self.owner,
        })
    }
}

/// Header length in bytes.
pub const HEADER_LEN: usize = 32;

/// Full message length in bytes.
pub const MESSAGE_LEN: usize = HEADER_LEN + OpRecord::LEN;

/// One inter-node plock message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Message {
    /// Message kind.
    pub kind: MsgKind,
    /// Sending node.
    pub from: NodeId,
    /// Destination node; 0 addresses every member.
    pub to: NodeId,
    /// Mount group the message belongs to.
    pub group: GroupId,
    /// Reserved flag bits.
    pub flags: u8,
    /// Reserved auxiliary data.
    pub aux: u64,
    /// The carried operation record.
    pub op: OpRecord,
}

impl Message {
    /// A replicated lock/unlock operation.
    pub fn plock(group: GroupId, from: NodeId, op: &LockOp) -> Self {
        Self::new(MsgKind::Plock, group, from, OpRecord::from_op(group, op, 0))
    }

    /// An ownership announcement proposing `owner` (0 = relinquish).
    pub fn own(group: GroupId, from: NodeId, number: ResourceId, owner: NodeId) -> Self {
        let op = OpRecord {
            version: RECORD_VERSION,
            node: owner,
            number,
            fsid: group,
            ..Default::default()
        };
        Self::new(MsgKind::Own, group, from, op)
    }

    /// A request to free an idle unowned resource.
    pub fn drop_resource(group: GroupId, from: NodeId, number: ResourceId) -> Self {
        let op = OpRecord {
            version: RECORD_VERSION,
            number,
            fsid: group,
            ..Default::default()
        };
        Self::new(MsgKind::Drop, group, from, op)
    }

    /// One lock entry synced by a relinquishing owner.
    pub fn sync_lock(group: GroupId, from: NodeId, number: ResourceId, po: &PosixLock) -> Self {
        let op = OpRecord {
            version: RECORD_VERSION,
            optype: OPTYPE_LOCK,
            ex: po.exclusive as u8,
            pid: po.pid,
            node: po.node,
            fsid: group,
            number,
            start: po.start,
            end: po.end,
            owner: po.owner,
            ..Default::default()
        };
        Self::new(MsgKind::SyncLock, group, from, op)
    }

    /// One waiter entry synced by a relinquishing owner.
    pub fn sync_waiter(group: GroupId, from: NodeId, op: &LockOp) -> Self {
        Self::new(
            MsgKind::SyncWaiter,
            group,
            from,
            OpRecord::from_op(group, op, 0),
        )
    }

    fn new(kind: MsgKind, group: GroupId, from: NodeId, op: OpRecord) -> Self {
        Self {
            kind,
            from,
            to: 0,
            group,
            flags: 0,
            aux: 0,
            op,
        }
    }

    /// Encode to the little-endian wire layout.
    pub fn encode(&self) -> [u8; MESSAGE_LEN] {
        let mut buf = [0u8; MESSAGE_LEN];
        buf[0..2].copy_from_slice(&PROTO_VERSION[0].to_le_bytes());
        buf[2..4].copy_from_slice(&PROTO_VERSION[1].to_le_bytes());
        buf[4..6].copy_from_slice(&PROTO_VERSION[2].to_le_bytes());
        buf[6] = self.kind.to_wire();
        buf[7] = self.flags;
        buf[8..12].copy_from_slice(&self.from.to_le_bytes());
        buf[12..16].copy_from_slice(&self.to.to_le_bytes());
        buf[16..20].copy_from_slice(&self.group.to_le_bytes());
        buf[24..32].copy_from_slice(&self.aux.to_le_bytes());
        buf[HEADER_LEN..].copy_from_slice(&self.op.encode());
        buf
    }

    /// Decode from the little-endian wire layout, rejecting incompatible
    /// protocol versions.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < MESSAGE_LEN {
            return Err(PlockError::ShortMessage {
                got: buf.len(),
                need: MESSAGE_LEN,
            });
        }
        let major = u16::from_le_bytes(buf[0..2].try_into().unwrap());
        if major != PROTO_VERSION[0] {
            return Err(PlockError::VersionMismatch {
                got: major,
                support: PROTO_VERSION[0],
            });
        }
        Ok(Self {
            kind: MsgKind::from_wire(buf[6])?,
            flags: buf[7],
            from: u32::from_le_bytes(buf[8..12].try_into().unwrap()),
            to: u32::from_le_bytes(buf[12..16].try_into().unwrap()),
            group: u32::from_le_bytes(buf[16..20].try_into().unwrap()),
            aux: u64::from_le_bytes(buf[24..32].try_into().unwrap()),
            op: OpRecord::decode(&buf[HEADER_LEN..])?,
        })
    }
}
