//! Per-mountgroup lock coordination context.
//!
//! A [`MountGroup`] owns the resource table for one mounted filesystem and
//! handles every event that can touch it: lock requests read from the
//! kernel channel, plock-class messages delivered by the broadcast
//! transport, the periodic drop sweep, and checkpoint installation for a
//! joining node. All handlers run on the group's single logical thread.
//!
//! The ownership protocol lives here. A resource is either replicated on
//! every member (unowned: every operation is broadcast and applied
//! deterministically by all) or held by one node (owned: the owner applies
//! operations locally with no messaging). Ownership moves through
//! announcement messages; a relinquishing owner first syncs its lock state
//! to everyone, then announces owner zero. States that the protocol should
//! never reach are logged and the triggering message dropped; sync and drop
//! messages converge the state over time, so anomalies heal rather than
//! crash the daemon.

use crate::config::PlockTuning;
use crate::engine::{self, LockStatus};
use crate::kernel::{self, ResultSink};
use crate::observability;
use crate::proto::{Message, MsgKind};
use crate::resource::{Resource, ResourceTable};
use crate::transport::Broadcast;
use crate::types::{
    GroupId, LockOp, LockWaiter, NodeId, OpKind, OwnerState, PosixLock, ResourceId, SyncState,
};
use std::io::{self, Write};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info};

/// Join synchronization phase of this node relative to the group.
///
/// A joining node must not apply messages whose effects are already in the
/// checkpoint it will read, and must buffer those that are not.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinPhase {
    /// Before our join is announced; delivered messages are reflected in
    /// the checkpoint and can be ignored.
    Ignoring,
    /// Join announced but lock state not yet retrieved; messages are saved
    /// and replayed after the checkpoint is installed.
    Saving,
    /// Lock state is synchronized; messages are processed directly.
    Synced,
}

/// Per-group operation counters.
#[derive(Debug, Default)]
pub struct GroupStats {
    /// Kernel lock requests processed.
    pub ops_read: u64,
    /// Plock-class messages processed.
    pub messages: u64,
}

/// One mount group's plock coordination state.
pub struct MountGroup {
    pub(crate) id: GroupId,
    pub(crate) name: String,
    pub(crate) node: NodeId,
    pub(crate) tuning: PlockTuning,
    pub(crate) table: ResourceTable,
    pub(crate) join: JoinPhase,
    pub(crate) saved: Vec<Message>,
    pub(crate) members: Vec<NodeId>,
    pub(crate) stopped: bool,
    pub(crate) stalled: Vec<LockOp>,
    /// This node created the group's checkpoint and owns its handle.
    pub(crate) ckpt_owned: bool,
    /// Lock state changed since the last checkpoint store.
    pub(crate) dirty: bool,
    pub(crate) drop_last: Instant,
    pub(crate) stats: GroupStats,
    pub(crate) broadcast: Arc<dyn Broadcast>,
    pub(crate) results: Arc<dyn ResultSink>,
}

impl MountGroup {
    /// Create a group context.
    pub fn new(
        id: GroupId,
        name: impl Into<String>,
        node: NodeId,
        tuning: PlockTuning,
        join: JoinPhase,
        broadcast: Arc<dyn Broadcast>,
        results: Arc<dyn ResultSink>,
    ) -> Self {
        let ownership = tuning.ownership;
        Self {
            id,
            name: name.into(),
            node,
            tuning,
            table: ResourceTable::new(ownership),
            join,
            saved: Vec::new(),
            members: Vec::new(),
            stopped: false,
            stalled: Vec::new(),
            ckpt_owned: false,
            dirty: false,
            drop_last: Instant::now(),
            stats: GroupStats::default(),
            broadcast,
            results,
        }
    }

    /// Group identifier (filesystem id).
    pub fn id(&self) -> GroupId {
        self.id
    }

    /// Group name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// This node's id.
    pub fn node_id(&self) -> NodeId {
        self.node
    }

    /// Checkpoint name for this group.
    pub fn checkpoint_name(&self) -> String {
        format!("plock.{}", self.name)
    }

    /// Current members, as delivered by the membership service.
    pub fn members(&self) -> &[NodeId] {
        &self.members
    }

    /// True when this node has the lowest surviving id and is responsible
    /// for checkpoint creation.
    pub fn is_master(&self) -> bool {
        self.members.iter().min().copied() == Some(self.node)
    }

    /// Current join phase.
    pub fn join_phase(&self) -> JoinPhase {
        self.join
    }

    /// Look up a resource.
    pub fn resource(&self, number: ResourceId) -> Option<&Resource> {
        self.table.get(number)
    }

    /// Number of resources in the table.
    pub fn resource_count(&self) -> usize {
        self.table.len()
    }

    /// Per-group counters.
    pub fn stats(&self) -> &GroupStats {
        &self.stats
    }

    /// Submit a lock request read from the kernel channel.
    ///
    /// While the group is stopped for a membership change, lock and unlock
    /// requests are stalled until the change commits; get-probes only read
    /// local state and are answered immediately.
    pub fn submit_local(&mut self, op: LockOp) {
        if self.stopped && op.kind != OpKind::Get {
            self.stalled.push(op);
            return;
        }
        self.handle_local_op(op);
    }

    /// Block new local lock/unlock processing (membership stop callback).
    pub fn stop(&mut self) {
        self.stopped = true;
    }

    /// Commit a membership change and run any stalled requests.
    pub fn resume(&mut self) {
        self.stopped = false;
        let stalled = std::mem::take(&mut self.stalled);
        for op in stalled {
            self.handle_local_op(op);
        }
    }

    fn handle_local_op(&mut self, op: LockOp) {
        self.stats.ops_read += 1;
        observability::record_op_read(op.kind);
        if self.stats.ops_read % 1000 == 0 {
            info!(group = %self.name, ops = self.stats.ops_read, "plock ops processed");
        }
        debug!(
            group = %self.name,
            number = %format_args!("{:x}", op.number),
            op = op.kind.tag(),
            mode = op.mode_tag(),
            start = op.start,
            end = op.end,
            node = op.node,
            pid = op.pid,
            wait = op.wait,
            "read plock"
        );

        if op.kind == OpKind::Get {
            self.do_get(&op);
            return;
        }

        let owner = self.table.find_or_create(op.number).owner;
        match owner {
            OwnerState::Unowned { .. } => {
                // state replicated on all nodes; applied on delivery
                self.send_message(&Message::plock(self.id, self.node, &op));
            }
            OwnerState::Owned(n) if n == self.node => {
                // our plocks are local
                self.apply_plock(op);
            }
            _ => {
                // resolving: try to become the owner; owned elsewhere: ask
                // the owner to give it up; both via an announcement
                self.request_ownership(op);
            }
        }
    }

    /// Park a local op until ownership resolves, announcing our claim if no
    /// announcement is already outstanding.
    fn request_ownership(&mut self, op: LockOp) {
        let r = self.table.get_mut(op.number).expect("resource exists");
        let outstanding = !r.pending.is_empty();
        r.pending.push(op);
        if outstanding {
            debug!(
                group = %self.name,
                number = %format_args!("{:x}", op.number),
                "ownership request already pending"
            );
            return;
        }
        self.send_message(&Message::own(self.id, self.node, op.number, self.node));
    }

    /// Answer a get-probe from local state only. Probes are never broadcast
    /// and never create a resource.
    fn do_get(&mut self, op: &LockOp) {
        let blocker = self
            .table
            .get(op.number)
            .and_then(|r| engine::blocking_lock(r, op))
            .copied();
        let rec = kernel::get_result_record(self.id, op, blocker.as_ref());
        if let Err(e) = self.results.write_result(&rec) {
            error!(group = %self.name, error = %e, "plock result write failed");
        }
    }

    /// Deliver one plock-class message from the broadcast transport.
    pub fn deliver(&mut self, msg: Message) {
        match self.join {
            JoinPhase::Ignoring => {
                debug!(group = %self.name, "not saving plock messages yet");
                return;
            }
            JoinPhase::Saving => {
                self.saved.push(msg);
                return;
            }
            JoinPhase::Synced => {}
        }

        self.stats.messages += 1;
        observability::record_message(msg.kind.tag());
        if self.stats.messages % 1000 == 0 {
            info!(group = %self.name, messages = self.stats.messages, "plock messages processed");
        }

        match msg.kind {
            MsgKind::Plock => self.receive_plock(&msg),
            MsgKind::Own => self.receive_own(&msg),
            MsgKind::Drop => self.receive_drop(&msg),
            MsgKind::SyncLock | MsgKind::SyncWaiter => self.receive_sync(&msg),
        }
    }

    /// Install lock state retrieved from the group checkpoint, then replay
    /// messages saved during the join window.
    pub fn install_checkpoint(&mut self, resources: Vec<Resource>) {
        info!(
            group = %self.name,
            resources = resources.len(),
            saved = self.saved.len(),
            "installing lock state from checkpoint"
        );
        for r in resources {
            self.table.insert(r);
        }
        self.join = JoinPhase::Synced;
        let saved = std::mem::take(&mut self.saved);
        for msg in saved {
            self.deliver(msg);
        }
    }

    fn receive_plock(&mut self, msg: &Message) {
        let op = match msg.op.to_op() {
            Ok(op) => op,
            Err(e) => {
                error!(group = %self.name, from = msg.from, error = %e, "bad plock op");
                if msg.from == self.node {
                    let mut rec = msg.op;
                    rec.rv = -libc::EINVAL;
                    if let Err(e) = self.results.write_result(&rec) {
                        error!(group = %self.name, error = %e, "plock result write failed");
                    }
                }
                return;
            }
        };

        debug!(
            group = %self.name,
            number = %format_args!("{:x}", op.number),
            op = op.kind.tag(),
            mode = op.mode_tag(),
            start = op.start,
            end = op.end,
            from = msg.from,
            pid = op.pid,
            wait = op.wait,
            "receive plock"
        );

        if op.kind == OpKind::Get {
            // probes are local-only and never broadcast
            debug!(group = %self.name, from = msg.from, "ignoring broadcast get-probe");
            return;
        }

        if msg.from != op.node {
            error!(
                group = %self.name,
                from = msg.from,
                node = op.node,
                "plock sender mismatch"
            );
            return;
        }

        if self.table.get(op.number).is_none() {
            if self.table.ownership() {
                // raced with a concurrent drop; the op will be resent once
                // ownership is re-established. If we sent it, start that.
                debug!(
                    group = %self.name,
                    number = %format_args!("{:x}", op.number),
                    from = msg.from,
                    "plock for dropped resource"
                );
                if msg.from != self.node {
                    return;
                }
                self.table.find_or_create(op.number);
                self.request_ownership(op);
                return;
            }
            self.table.find_or_create(op.number);
        }

        let owner = self.table.get_mut(op.number).expect("resource exists").owner;
        if !owner.is_unowned() {
            // possible in odd drop/own races; state converges regardless
            error!(
                group = %self.name,
                number = %format_args!("{:x}", op.number),
                from = msg.from,
                owner = %owner,
                "plock on resource with owner"
            );
        }

        match owner {
            OwnerState::Unowned { .. } => self.apply_plock(op),
            OwnerState::Owned(n) if n == self.node => {
                if msg.from == self.node {
                    self.apply_plock(op);
                }
            }
            _ => {
                // resolving or owned elsewhere: only our own ops matter,
                // and they wait for the owner
                if msg.from == self.node {
                    self.table
                        .get_mut(op.number)
                        .expect("resource exists")
                        .pending
                        .push(op);
                }
            }
        }
    }

    /// Apply one lock/unlock/get op against the resource, reporting results
    /// for locally originated requests and serving freed waiters.
    fn apply_plock(&mut self, op: LockOp) {
        match op.kind {
            OpKind::Lock => {
                self.dirty = true;
                let Some(r) = self.table.get_mut(op.number) else {
                    return;
                };
                let status = engine::apply_lock(r, op);
                if op.node == self.node {
                    match status {
                        LockStatus::Granted => self.write_result(&op, 0),
                        LockStatus::Denied => self.write_result(&op, -libc::EAGAIN),
                        LockStatus::Queued => {}
                    }
                }
                self.finish_op(op.number);
            }
            OpKind::Unlock => {
                self.dirty = true;
                let Some(r) = self.table.get_mut(op.number) else {
                    return;
                };
                engine::unlock_internal(r, &op);
                if op.node == self.node {
                    self.write_result(&op, 0);
                }
                self.finish_op(op.number);
            }
            OpKind::Get => self.do_get(&op),
        }
    }

    /// Serve waiters freed by the last operation and drop the resource if
    /// the non-ownership model leaves it empty.
    fn finish_op(&mut self, number: ResourceId) {
        let granted = match self.table.get_mut(number) {
            Some(r) => engine::drain_waiters(r),
            None => return,
        };
        for op in granted {
            if op.node == self.node {
                self.write_result(&op, 0);
            }
        }
        self.table.release_if_idle(number);
    }

    fn receive_own(&mut self, msg: &Message) {
        let number = msg.op.number;
        let proposed = msg.op.node;
        let from = msg.from;

        debug!(
            group = %self.name,
            number = %format_args!("{:x}", number),
            from = from,
            proposed = proposed,
            "receive own"
        );

        self.table.find_or_create(number);
        let owner = self.table.get(number).expect("resource exists").owner;
        let me = self.node;

        if from == me {
            if proposed == 0 {
                // our own relinquish announcement came back
                match owner {
                    OwnerState::Unowned { .. } => {
                        self.set_owner(number, OwnerState::Unowned { acked: true });
                    }
                    _ => self.own_anomaly(number, from, proposed, owner),
                }
            } else if proposed == me {
                match owner {
                    OwnerState::Resolving => {
                        // we have gained ownership
                        self.set_owner(number, OwnerState::Owned(me));
                        self.apply_pending(number);
                    }
                    OwnerState::Unowned { .. } => {
                        // someone else resolved it to unowned first
                        self.flush_pending_broadcast(number);
                    }
                    OwnerState::Owned(n) if n == me => {
                        self.own_anomaly(number, from, proposed, owner)
                    }
                    OwnerState::Owned(_) => {
                        // owned elsewhere; the owner will relinquish shortly
                    }
                }
            } else {
                // we only ever propose zero or ourselves
                self.own_anomaly(number, from, proposed, owner);
            }
            return;
        }

        if proposed == 0 {
            // another node relinquishes
            match owner {
                OwnerState::Owned(n) if n != me => {
                    self.set_owner(number, OwnerState::Unowned { acked: true });
                    self.flush_pending_broadcast(number);
                }
                _ => self.own_anomaly(number, from, proposed, owner),
            }
        } else if proposed == from {
            match owner {
                OwnerState::Resolving => {
                    // normal path for a node becoming owner
                    self.set_owner(number, OwnerState::Owned(from));
                }
                OwnerState::Owned(n) if n == me => {
                    self.relinquish(number);
                }
                OwnerState::Unowned { .. } => {
                    // we already set owner to zero ahead of our own
                    // relinquish echo; benign
                }
                OwnerState::Owned(_) => {
                    // current owner will relinquish
                }
            }
        } else {
            // a node may only propose zero or itself
            self.own_anomaly(number, from, proposed, owner);
        }
    }

    fn own_anomaly(&self, number: ResourceId, from: NodeId, proposed: NodeId, owner: OwnerState) {
        error!(
            group = %self.name,
            number = %format_args!("{:x}", number),
            from = from,
            proposed = proposed,
            owner = %owner,
            "unexpected ownership transition"
        );
    }

    fn set_owner(&mut self, number: ResourceId, owner: OwnerState) {
        if let Some(r) = self.table.get_mut(number) {
            r.owner = owner;
        }
    }

    /// Give up ownership: sync the full local lock state to all members,
    /// announce owner zero, and drop to unowned immediately so local ops
    /// arriving before our own echo queue correctly instead of applying
    /// against a stale owner.
    fn relinquish(&mut self, number: ResourceId) {
        self.send_syncs(number);
        self.send_message(&Message::own(self.id, self.node, number, 0));
        self.set_owner(number, OwnerState::Unowned { acked: false });
    }

    fn send_syncs(&mut self, number: ResourceId) {
        let mut msgs = Vec::new();
        if let Some(r) = self.table.get_mut(number) {
            for po in &mut r.locks {
                msgs.push(Message::sync_lock(self.id, self.node, number, po));
                po.sync = SyncState::Syncing;
            }
            for w in &mut r.waiters {
                msgs.push(Message::sync_waiter(self.id, self.node, &w.op));
                w.sync = SyncState::Syncing;
            }
        }
        for msg in &msgs {
            self.send_message(msg);
        }
    }

    /// Ownership resolved to us: apply the parked local ops.
    fn apply_pending(&mut self, number: ResourceId) {
        let ops = match self.table.get_mut(number) {
            Some(r) => std::mem::take(&mut r.pending),
            None => return,
        };
        for op in ops {
            self.apply_plock(op);
        }
    }

    /// Ownership resolved to unowned: broadcast the parked local ops as
    /// plain replicated operations.
    fn flush_pending_broadcast(&mut self, number: ResourceId) {
        let ops = match self.table.get_mut(number) {
            Some(r) => std::mem::take(&mut r.pending),
            None => return,
        };
        for op in ops {
            self.send_message(&Message::plock(self.id, self.node, &op));
        }
    }

    fn receive_sync(&mut self, msg: &Message) {
        let number = msg.op.number;

        debug!(
            group = %self.name,
            number = %format_args!("{:x}", number),
            from = msg.from,
            start = msg.op.start,
            end = msg.op.end,
            "receive sync"
        );

        if self.table.get(number).is_none() {
            error!(
                group = %self.name,
                number = %format_args!("{:x}", number),
                from = msg.from,
                "sync for unknown resource"
            );
            return;
        }

        if msg.from == self.node {
            // our sync burst came back: this entry is now on all nodes
            self.clear_syncing(number, msg);
            return;
        }

        let r = self.table.get_mut(number).expect("resource exists");
        match msg.kind {
            MsgKind::SyncLock => {
                // authoritative snapshot from the relinquishing owner;
                // inserted without conflict checks
                r.locks.push(PosixLock {
                    start: msg.op.start,
                    end: msg.op.end,
                    exclusive: msg.op.ex != 0,
                    node: msg.op.node,
                    pid: msg.op.pid,
                    owner: msg.op.owner,
                    sync: SyncState::Clean,
                });
            }
            MsgKind::SyncWaiter => match msg.op.to_op() {
                Ok(op) => r.waiters.push(LockWaiter::new(op)),
                Err(e) => {
                    error!(group = %self.name, from = msg.from, error = %e, "bad sync waiter")
                }
            },
            _ => unreachable!("dispatched on sync kinds"),
        }
    }

    fn clear_syncing(&mut self, number: ResourceId, msg: &Message) {
        let Some(r) = self.table.get_mut(number) else {
            return;
        };

        for po in &mut r.locks {
            if po.sync == SyncState::Syncing
                && msg.op.start == po.start
                && msg.op.end == po.end
                && msg.op.node == po.node
                && msg.op.owner == po.owner
                && msg.op.pid == po.pid
                && (msg.op.ex != 0) == po.exclusive
            {
                po.sync = SyncState::Clean;
                return;
            }
        }

        for w in &mut r.waiters {
            if w.sync == SyncState::Syncing
                && msg.op.start == w.op.start
                && msg.op.end == w.op.end
                && msg.op.node == w.op.node
                && msg.op.owner == w.op.owner
                && msg.op.pid == w.op.pid
                && (msg.op.ex != 0) == w.op.exclusive
            {
                w.sync = SyncState::Clean;
                return;
            }
        }

        error!(
            group = %self.name,
            number = %format_args!("{:x}", number),
            start = msg.op.start,
            end = msg.op.end,
            node = msg.op.node,
            "no syncing entry matches sync echo"
        );
    }

    fn receive_drop(&mut self, msg: &Message) {
        let number = msg.op.number;

        debug!(
            group = %self.name,
            number = %format_args!("{:x}", number),
            from = msg.from,
            "receive drop"
        );

        let Some(r) = self.table.get(number) else {
            // two nodes sent drop at once
            debug!(
                group = %self.name,
                number = %format_args!("{:x}", number),
                from = msg.from,
                "drop for unknown resource"
            );
            return;
        };

        if !r.owner.is_unowned() {
            // raced with a concurrent announcement; the dropper retries
            debug!(
                group = %self.name,
                number = %format_args!("{:x}", number),
                from = msg.from,
                owner = %r.owner,
                "drop raced with ownership"
            );
            return;
        }

        if !r.pending.is_empty() {
            error!(
                group = %self.name,
                number = %format_args!("{:x}", number),
                from = msg.from,
                "drop for resource with pending ops"
            );
            return;
        }

        // the decision must depend only on state identical on all nodes
        if r.is_idle() {
            self.table.remove(number);
        } else {
            debug!(
                group = %self.name,
                number = %format_args!("{:x}", number),
                from = msg.from,
                "drop for resource in use"
            );
        }
    }

    /// Periodic sweep bounding resource-table growth.
    ///
    /// Up to `drop_count` idle resources older than `drop_age` are acted on
    /// per sweep, oldest first: self-owned resources are relinquished, and
    /// unowned resources whose relinquish has been acknowledged get an
    /// explicit drop broadcast so every member frees the structure.
    pub fn drop_sweep(&mut self, now: Instant) {
        if !self.table.ownership() {
            return;
        }
        if now.duration_since(self.drop_last) < self.tuning.drop_interval {
            return;
        }
        self.drop_last = now;

        let mut candidates: Vec<(Instant, ResourceId, OwnerState)> = self
            .table
            .iter()
            .filter(|r| r.is_idle())
            .filter(|r| now.duration_since(r.last_access) >= self.tuning.drop_age)
            .filter(|r| r.owner.is_unowned() || r.owner.is_self(self.node))
            .map(|r| (r.last_access, r.number, r.owner))
            .collect();
        candidates.sort_by_key(|&(at, number, _)| (at, number));

        for (_, number, owner) in candidates
            .into_iter()
            .take(self.tuning.drop_count as usize)
        {
            match owner {
                OwnerState::Owned(n) if n == self.node => {
                    self.send_message(&Message::own(self.id, self.node, number, 0));
                    self.set_owner(number, OwnerState::Unowned { acked: false });
                }
                OwnerState::Unowned { acked: true } => {
                    self.send_message(&Message::drop_resource(self.id, self.node, number));
                }
                _ => {}
            }
        }
    }

    /// Write the held-lock and waiter state, one line per entry.
    pub fn dump_locks(&self, w: &mut dyn Write) -> io::Result<()> {
        let mut numbers = self.table.numbers();
        numbers.sort_unstable();
        for number in numbers {
            let r = self.table.get(number).expect("resource exists");
            for po in &r.locks {
                writeln!(
                    w,
                    "{} {} {}-{} nodeid {} pid {} owner {:x}",
                    r.number,
                    if po.exclusive { "WR" } else { "RD" },
                    po.start,
                    po.end,
                    po.node,
                    po.pid,
                    po.owner
                )?;
            }
            for lw in &r.waiters {
                writeln!(
                    w,
                    "{} WAITING {} {}-{} nodeid {} pid {} owner {:x}",
                    r.number,
                    if lw.op.exclusive { "WR" } else { "RD" },
                    lw.op.start,
                    lw.op.end,
                    lw.op.node,
                    lw.op.pid,
                    lw.op.owner
                )?;
            }
        }
        Ok(())
    }

    pub(crate) fn write_result(&self, op: &LockOp, rv: i32) {
        let rec = kernel::result_record(self.id, op, rv);
        if let Err(e) = self.results.write_result(&rec) {
            error!(group = %self.name, error = %e, "plock result write failed");
        }
    }

    pub(crate) fn send_message(&self, msg: &Message) {
        if let Err(e) = self.broadcast.send(msg) {
            error!(group = %self.name, error = %e, "plock message send failed");
        }
    }
}
