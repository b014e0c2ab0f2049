//! Deterministic lock-range engine.
//!
//! Applies lock, unlock, and get operations against one resource's range
//! set. Every member runs the same engine over the same totally ordered
//! operation stream, so replicated state converges without coordination;
//! nothing in here may consult anything but the resource and the operation.
//!
//! Ranges are inclusive `[start, end]` unsigned 64-bit offsets. An incoming
//! range is decomposed against each overlapping same-lineage entry into one
//! of four shapes: exact match, boundary-touching containment, strict
//! containment, and coverage/partial overlap. The first three terminate the
//! scan; the last two shrink or remove the existing entry and keep
//! scanning, since one request can subsume several fragments.

use crate::resource::Resource;
use crate::types::{LockOp, LockWaiter, PosixLock, SyncState};

/// Outcome of a lock request against current state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockStatus {
    /// The range was applied.
    Granted,
    /// The request conflicts and was queued as a waiter.
    Queued,
    /// The request conflicts and the caller declined to wait.
    Denied,
}

/// How an incoming range `[ns, ne]` relates to an existing range `[es, ee]`
/// that it overlaps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Overlap {
    /// Identical ranges.
    Exact,
    /// New inside existing, sharing one boundary.
    InsideTouching,
    /// New strictly inside existing.
    InsideStrict,
    /// New covers existing entirely.
    Covers,
    /// Ranges overlap without containment.
    Partial,
}

fn ranges_overlap(s1: u64, e1: u64, s2: u64, e2: u64) -> bool {
    !(e1 < s2 || s1 > e2)
}

fn classify(ns: u64, ne: u64, es: u64, ee: u64) -> Overlap {
    if ns == es && ne == ee {
        Overlap::Exact
    } else if (ns == es && ne < ee) || (ns > es && ne == ee) {
        Overlap::InsideTouching
    } else if ns > es && ne < ee {
        Overlap::InsideStrict
    } else if ns <= es && ne >= ee {
        Overlap::Covers
    } else {
        Overlap::Partial
    }
}

/// Shrink `[start, end]` to the part not covered by `[by_start, by_end]`.
/// Valid only for partial overlaps where exactly one side survives.
fn shrink(start: &mut u64, end: &mut u64, by_start: u64, by_end: u64) {
    if *start < by_start {
        *end = by_start - 1;
    } else {
        *start = by_end + 1;
    }
}

fn entry(op: &LockOp, start: u64, end: u64, exclusive: bool) -> PosixLock {
    PosixLock {
        start,
        end,
        exclusive,
        node: op.node,
        pid: op.pid,
        owner: op.owner,
        sync: SyncState::Clean,
    }
}

/// Test whether `op` conflicts with any lock of a different lineage.
///
/// Entries of the requesting lineage never conflict with their own request;
/// for the rest, overlapping ranges conflict unless both sides are shared.
pub fn is_conflict(r: &Resource, op: &LockOp) -> bool {
    blocking_lock(r, op).is_some()
}

/// Find the first lock that blocks `op`, for get-probes and conflict tests.
pub fn blocking_lock<'a>(r: &'a Resource, op: &LockOp) -> Option<&'a PosixLock> {
    r.locks.iter().find(|po| {
        !po.same_lineage(op)
            && po.overlaps(op.start, op.end)
            && (op.exclusive || po.exclusive)
    })
}

/// Apply a conflict-free lock range to the resource.
///
/// Each overlapping same-lineage entry with a different mode is converted:
/// an exact match flips in place; boundary-touching containment shrinks the
/// remainder into a new entry of the old mode and converts the existing
/// entry; strict containment splits into front and back fragments of the
/// old mode around the converted middle. Entries the new range covers are
/// removed and partially overlapped entries shrunk, in both cases
/// continuing the scan; whatever lineage-owned span remains uncovered gets
/// a fresh entry at the end.
pub fn lock_internal(r: &mut Resource, op: &LockOp) {
    let mut i = 0;
    while i < r.locks.len() {
        let (es, ee, eex) = {
            let po = &r.locks[i];
            if !po.same_lineage(op) || !po.overlaps(op.start, op.end) {
                i += 1;
                continue;
            }
            (po.start, po.end, po.exclusive)
        };

        match classify(op.start, op.end, es, ee) {
            Overlap::Exact => {
                if eex != op.exclusive {
                    r.locks[i].exclusive = op.exclusive;
                }
                return;
            }
            Overlap::InsideTouching => {
                if eex == op.exclusive {
                    return;
                }
                let (mut rs, mut re) = (es, ee);
                shrink(&mut rs, &mut re, op.start, op.end);
                let po = &mut r.locks[i];
                po.start = op.start;
                po.end = op.end;
                po.exclusive = op.exclusive;
                r.locks.push(entry(op, rs, re, !op.exclusive));
                return;
            }
            Overlap::InsideStrict => {
                if eex == op.exclusive {
                    return;
                }
                r.locks.push(entry(op, es, op.start - 1, !op.exclusive));
                r.locks.push(entry(op, op.end + 1, ee, !op.exclusive));
                let po = &mut r.locks[i];
                po.start = op.start;
                po.end = op.end;
                po.exclusive = op.exclusive;
                return;
            }
            Overlap::Covers => {
                r.locks.remove(i);
            }
            Overlap::Partial => {
                let po = &mut r.locks[i];
                shrink(&mut po.start, &mut po.end, op.start, op.end);
                i += 1;
            }
        }
    }

    r.locks.push(entry(op, op.start, op.end, op.exclusive));
}

/// Release a range from the resource.
///
/// The same four-way decomposition, with the release range in place of the
/// new lock: exact match deletes; boundary-touching shrinks in place;
/// strict containment keeps the front fragment and adds a back fragment of
/// the old mode; covered entries are deleted and partial overlaps shrunk,
/// continuing the scan. Releasing a range nothing covers is not an error.
pub fn unlock_internal(r: &mut Resource, op: &LockOp) {
    let mut i = 0;
    while i < r.locks.len() {
        let (es, ee, eex) = {
            let po = &r.locks[i];
            if !po.same_lineage(op) || !po.overlaps(op.start, op.end) {
                i += 1;
                continue;
            }
            (po.start, po.end, po.exclusive)
        };

        match classify(op.start, op.end, es, ee) {
            Overlap::Exact => {
                r.locks.remove(i);
                return;
            }
            Overlap::InsideTouching => {
                let po = &mut r.locks[i];
                shrink(&mut po.start, &mut po.end, op.start, op.end);
                return;
            }
            Overlap::InsideStrict => {
                r.locks[i].end = op.start - 1;
                r.locks.push(entry(op, op.end + 1, ee, eex));
                return;
            }
            Overlap::Covers => {
                r.locks.remove(i);
            }
            Overlap::Partial => {
                let po = &mut r.locks[i];
                shrink(&mut po.start, &mut po.end, op.start, op.end);
                i += 1;
            }
        }
    }
}

/// Dispatch a lock request: apply if conflict-free, otherwise queue or deny
/// according to the request's wait flag.
pub fn apply_lock(r: &mut Resource, op: LockOp) -> LockStatus {
    if is_conflict(r, &op) {
        if op.wait {
            r.waiters.push(LockWaiter::new(op));
            LockStatus::Queued
        } else {
            LockStatus::Denied
        }
    } else {
        lock_internal(r, &op);
        LockStatus::Granted
    }
}

/// Serve the waiter queue greedily, FIFO.
///
/// Every waiter whose conflicts have cleared is removed and applied;
/// the applied operations are returned so the caller can report results
/// for the locally originated ones.
pub fn drain_waiters(r: &mut Resource) -> Vec<LockOp> {
    let mut granted = Vec::new();
    let mut i = 0;
    while i < r.waiters.len() {
        let op = r.waiters[i].op;
        if is_conflict(r, &op) {
            i += 1;
            continue;
        }
        r.waiters.remove(i);
        lock_internal(r, &op);
        granted.push(op);
    }
    granted
}
