//! Kernel lock-channel interface.
//!
//! The kernel delivers one fixed-size [`OpRecord`] per lock request through
//! a character-device-style channel and expects exactly one result record
//! written back for every locally originated lock/unlock request. The
//! daemon owns the read side; writing results goes through [`ResultSink`]
//! so the core stays testable without a device.

use crate::error::Result;
use crate::proto::OpRecord;
use crate::types::{LockOp, NodeId, PosixLock};

/// Write side of the kernel lock channel.
///
/// Implementations write one encoded [`OpRecord`] per call. The daemon
/// guarantees exactly one result per locally originated lock/unlock
/// request, including on early-exit error paths; results are never written
/// for operations that originated on other nodes.
pub trait ResultSink: Send + Sync {
    fn write_result(&self, rec: &OpRecord) -> Result<()>;
}

/// Build the result record for a completed lock/unlock operation.
///
/// `rv` is 0 on success or a negative errno.
pub fn result_record(fsid: u32, op: &LockOp, rv: i32) -> OpRecord {
    OpRecord::from_op(fsid, op, rv)
}

/// Build the result record for a get-probe.
///
/// On conflict the record reports the blocking lock's holder and range with
/// a positive result, mirroring fcntl GETLK semantics; otherwise the
/// requested fields are echoed back with a zero result.
pub fn get_result_record(fsid: u32, op: &LockOp, blocker: Option<&PosixLock>) -> OpRecord {
    let mut rec = OpRecord::from_op(fsid, op, 0);
    if let Some(po) = blocker {
        rec.rv = 1;
        rec.ex = po.exclusive as u8;
        rec.pid = po.pid;
        rec.start = po.start;
        rec.end = po.end;
    }
    rec
}

/// Stamp the originating node on a freshly read request record.
///
/// The kernel leaves the node field zero; the daemon fills in its own id
/// before the record enters the protocol.
pub fn stamp_origin(rec: &mut OpRecord, node: NodeId) {
    rec.node = node;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{OpKind, SyncState};

    fn probe_op() -> LockOp {
        LockOp {
            kind: OpKind::Get,
            number: 8,
            start: 0,
            end: 99,
            exclusive: true,
            wait: false,
            node: 1,
            pid: 10,
            owner: 0x1,
        }
    }

    #[test]
    fn test_get_result_no_conflict() {
        let rec = get_result_record(5, &probe_op(), None);
        assert_eq!(rec.rv, 0);
        assert_eq!(rec.start, 0);
        assert_eq!(rec.end, 99);
    }

    #[test]
    fn test_get_result_reports_blocker() {
        let po = PosixLock {
            start: 50,
            end: 150,
            exclusive: false,
            node: 2,
            pid: 77,
            owner: 0x2,
            sync: SyncState::Clean,
        };
        let rec = get_result_record(5, &probe_op(), Some(&po));
        assert_eq!(rec.rv, 1);
        assert_eq!(rec.pid, 77);
        assert_eq!(rec.start, 50);
        assert_eq!(rec.end, 150);
        assert_eq!(rec.ex, 0);
    }
}
