//! Membership-driven lock recovery.
//!
//! Membership changes arrive as a closed event enum in the same total
//! order as regular messages, on every member. Purging a failed or
//! departed node's locks inside that ordering is what keeps the replicated
//! state convergent: every member removes the same entries at the same
//! point in the message stream.

use crate::engine;
use crate::group::{JoinPhase, MountGroup};
use crate::observability;
use crate::proto::Message;
use crate::types::{NodeId, OwnerState};
use tracing::{debug, info};

/// Membership event for one mount group, delivered in message order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MembershipEvent {
    /// Block new local lock activity while the change is negotiated.
    Stop,
    /// The new membership, with who joined and who departed, and the
    /// event's sequence number.
    Start {
        members: Vec<NodeId>,
        joined: Vec<NodeId>,
        departed: Vec<NodeId>,
        seq: u64,
    },
    /// The change is committed on all members.
    Finish { seq: u64 },
    /// Final departure acknowledgment for this node (unmount).
    Terminate,
}

/// Deferred work a membership event asks of the daemon: checkpoint I/O runs
/// outside the group handler so one group's transfer never stalls another.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryAction {
    /// Store the group's lock state for a joining node.
    StoreCheckpoint { joiner: NodeId },
    /// Retrieve the group's lock state; we are the joiner.
    RetrieveCheckpoint,
    /// Remove the checkpoint this node created.
    UnlinkCheckpoint,
}

impl MountGroup {
    /// Apply one membership event, returning checkpoint work for the
    /// daemon to perform.
    pub fn apply_membership(&mut self, event: MembershipEvent) -> Vec<RecoveryAction> {
        match event {
            MembershipEvent::Stop => {
                self.stop();
                Vec::new()
            }
            MembershipEvent::Start {
                members,
                joined,
                departed,
                seq,
            } => {
                info!(
                    group = %self.name,
                    seq = seq,
                    members = ?members,
                    joined = ?joined,
                    departed = ?departed,
                    "membership start"
                );
                self.members = members;

                for node in &departed {
                    self.purge(*node, false);
                }

                let mut actions = Vec::new();
                if joined.iter().any(|&n| n == self.node) {
                    // we are the joiner: buffer messages until the
                    // checkpoint is installed
                    self.join = JoinPhase::Saving;
                    actions.push(RecoveryAction::RetrieveCheckpoint);
                } else if !joined.is_empty() && self.is_master() {
                    for &joiner in &joined {
                        actions.push(RecoveryAction::StoreCheckpoint { joiner });
                    }
                }
                actions
            }
            MembershipEvent::Finish { seq } => {
                debug!(group = %self.name, seq = seq, "membership finish");
                self.resume();
                Vec::new()
            }
            MembershipEvent::Terminate => {
                info!(group = %self.name, "terminate, purging all lock state");
                self.purge(0, true);
                if self.ckpt_owned {
                    self.ckpt_owned = false;
                    vec![RecoveryAction::UnlinkCheckpoint]
                } else {
                    Vec::new()
                }
            }
        }
    }

    /// Remove every lock and waiter belonging to `node` (or all of them,
    /// on unmount) from every resource.
    ///
    /// A purged resource owned by the departed node falls back to unowned
    /// and its parked local ops are broadcast; waiters freed by the purge
    /// are served; with the ownership model off, resources left empty are
    /// freed.
    pub fn purge(&mut self, node: NodeId, unmount: bool) -> usize {
        let mut purged = 0;
        let mut flush = Vec::new();
        let mut drain = Vec::new();

        for r in self.table.iter_mut() {
            let before = r.locks.len() + r.waiters.len();
            r.locks.retain(|po| po.node != node && !unmount);
            r.waiters.retain(|w| w.op.node != node && !unmount);
            purged += before - r.locks.len() - r.waiters.len();

            if r.owner == OwnerState::Owned(node) {
                r.owner = OwnerState::Unowned { acked: false };
                flush.push(r.number);
            }
            if !r.waiters.is_empty() {
                drain.push(r.number);
            }
        }

        for number in flush {
            let ops = match self.table.get_mut(number) {
                Some(r) => std::mem::take(&mut r.pending),
                None => continue,
            };
            for op in ops {
                self.send_message(&Message::plock(self.id, self.node, &op));
            }
        }

        for number in drain {
            let granted = match self.table.get_mut(number) {
                Some(r) => engine::drain_waiters(r),
                None => continue,
            };
            for op in granted {
                if op.node == self.node {
                    self.write_result(&op, 0);
                }
            }
        }

        if !self.table.ownership() {
            for number in self.table.numbers() {
                self.table.release_if_idle(number);
            }
        }

        if purged > 0 {
            self.dirty = true;
            observability::record_purged(purged);
        }
        info!(group = %self.name, node = node, purged = purged, "purged plocks");
        purged
    }
}
