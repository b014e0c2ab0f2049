//! Single-consumer event loop driving one or more mount groups.
//!
//! All resource-table mutation happens on this loop, one event at a time:
//! a lock request read from the kernel channel, a message delivered by the
//! broadcast transport, a membership event, or the periodic tick that runs
//! the rate limiter and drop sweeps. Handlers never re-enter the loop, so
//! the groups need no internal locking.
//!
//! Checkpoint transfers are the one kind of work that leaves the loop:
//! they run as background tasks against the external snapshot service, and
//! retrieval completion re-enters through the event channel. One group's
//! store/retrieve backoff therefore never stalls another group's events.

use crate::checkpoint::{self, SnapshotStore};
use crate::config::PlockConfig;
use crate::error::PlockError;
use crate::group::{JoinPhase, MountGroup};
use crate::kernel::{self, ResultSink};
use crate::observability;
use crate::proto::{Message, OpRecord};
use crate::recovery::{MembershipEvent, RecoveryAction};
use crate::resource::Resource;
use crate::transport::Broadcast;
use crate::types::GroupId;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, error, info};

/// Event loop tick period, driving rate-limit checks and drop sweeps.
const TICK: Duration = Duration::from_secs(1);

/// Rate-limit window length.
const RATE_WINDOW: Duration = Duration::from_secs(1);

/// One event from the cluster side of the daemon.
#[derive(Debug)]
pub enum BusEvent {
    /// A plock-class message delivered by the broadcast transport.
    Delivered(Message),
    /// A membership event for one group.
    Membership {
        group: GroupId,
        event: MembershipEvent,
    },
    /// A background checkpoint retrieval finished.
    CheckpointLoaded {
        group: GroupId,
        resources: Vec<Resource>,
    },
}

/// The plock coordination daemon for one node.
pub struct Daemon {
    cfg: PlockConfig,
    groups: HashMap<GroupId, MountGroup>,
    broadcast: Arc<dyn Broadcast>,
    results: Arc<dyn ResultSink>,
    snapshots: Arc<dyn SnapshotStore>,
    kernel_rx: Option<mpsc::Receiver<OpRecord>>,
    bus_rx: Option<mpsc::Receiver<BusEvent>>,
    bus_tx: mpsc::Sender<BusEvent>,
    rate_count: u32,
    rate_window: Instant,
}

impl Daemon {
    /// Create a daemon over the external service handles and event
    /// channels. The caller keeps the send sides of `kernel_rx` and
    /// `bus_rx` for its kernel-channel reader and transport adapter;
    /// `bus_tx` must feed the same channel as `bus_rx`.
    pub fn new(
        cfg: PlockConfig,
        broadcast: Arc<dyn Broadcast>,
        results: Arc<dyn ResultSink>,
        snapshots: Arc<dyn SnapshotStore>,
        kernel_rx: mpsc::Receiver<OpRecord>,
        bus_rx: mpsc::Receiver<BusEvent>,
        bus_tx: mpsc::Sender<BusEvent>,
    ) -> Self {
        observability::register_metrics();
        Self {
            cfg,
            groups: HashMap::new(),
            broadcast,
            results,
            snapshots,
            kernel_rx: Some(kernel_rx),
            bus_rx: Some(bus_rx),
            bus_tx,
            rate_count: 0,
            rate_window: Instant::now(),
        }
    }

    /// Register a mount group. An existing member or first mounter starts
    /// [`JoinPhase::Synced`]; a node joining an established group starts
    /// [`JoinPhase::Ignoring`] and synchronizes through the checkpoint.
    pub fn add_group(&mut self, id: GroupId, name: &str, join: JoinPhase) {
        info!(group = name, id = %format_args!("{:x}", id), "adding mount group");
        let group = MountGroup::new(
            id,
            name,
            self.cfg.node.id,
            self.cfg.plock.clone(),
            join,
            Arc::clone(&self.broadcast),
            Arc::clone(&self.results),
        );
        self.groups.insert(id, group);
    }

    /// Look up a group.
    pub fn group(&self, id: GroupId) -> Option<&MountGroup> {
        self.groups.get(&id)
    }

    /// Run the event loop until both input channels close.
    pub async fn run(mut self) {
        let mut kernel_rx = self.kernel_rx.take().expect("run called once");
        let mut bus_rx = self.bus_rx.take().expect("run called once");
        let mut tick = tokio::time::interval(TICK);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        info!(node = self.cfg.node.id, "plock daemon running");

        loop {
            tokio::select! {
                biased;
                ev = bus_rx.recv() => match ev {
                    Some(ev) => self.handle_bus(ev),
                    None => break,
                },
                rec = kernel_rx.recv(), if self.may_read_kernel() => match rec {
                    Some(rec) => self.handle_kernel(rec),
                    None => break,
                },
                _ = tick.tick() => self.handle_tick(),
            }
        }

        info!("plock daemon event loop stopped");
    }

    /// Whether the kernel channel may be read this round. Broadcasting new
    /// operations is paused while the transport is flow controlled or the
    /// rate limit window is exhausted.
    fn may_read_kernel(&self) -> bool {
        !self.broadcast.flow_controlled() && !self.rate_limited()
    }

    fn rate_limited(&self) -> bool {
        let limit = self.cfg.plock.rate_limit;
        limit != 0 && self.rate_count >= limit && self.rate_window.elapsed() < RATE_WINDOW
    }

    fn note_kernel_read(&mut self) {
        if self.cfg.plock.rate_limit == 0 {
            return;
        }
        self.rate_count += 1;
        if self.rate_count >= self.cfg.plock.rate_limit
            && self.rate_window.elapsed() >= RATE_WINDOW
        {
            self.rate_count = 0;
            self.rate_window = Instant::now();
        }
    }

    fn handle_kernel(&mut self, mut rec: OpRecord) {
        self.note_kernel_read();

        // the kernel leaves the node field zero
        kernel::stamp_origin(&mut rec, self.cfg.node.id);

        if !self.cfg.plock.enabled {
            self.reply(rec, -PlockError::PlocksOffline.to_errno());
            return;
        }

        let op = match rec.to_op() {
            Ok(op) => op,
            Err(e) => {
                error!(fsid = %format_args!("{:x}", rec.fsid), error = %e, "bad kernel record");
                self.reply(rec, -e.to_errno());
                return;
            }
        };

        let Some(group) = self.groups.get_mut(&rec.fsid) else {
            debug!(fsid = %format_args!("{:x}", rec.fsid), "request for unknown group");
            self.reply(rec, -PlockError::UnknownGroup(rec.fsid).to_errno());
            return;
        };
        group.submit_local(op);
    }

    /// Answer a kernel request that failed before reaching a group; every
    /// local request gets exactly one result.
    fn reply(&self, mut rec: OpRecord, rv: i32) {
        rec.rv = rv;
        if let Err(e) = self.results.write_result(&rec) {
            error!(error = %e, "plock result write failed");
        }
    }

    fn handle_bus(&mut self, event: BusEvent) {
        match event {
            BusEvent::Delivered(msg) => {
                let Some(group) = self.groups.get_mut(&msg.group) else {
                    debug!(
                        id = %format_args!("{:x}", msg.group),
                        from = msg.from,
                        "message for unknown group"
                    );
                    return;
                };
                group.deliver(msg);
            }
            BusEvent::Membership { group, event } => {
                let Some(g) = self.groups.get_mut(&group) else {
                    debug!(id = %format_args!("{:x}", group), "membership for unknown group");
                    return;
                };
                let terminate = event == MembershipEvent::Terminate;
                let actions = g.apply_membership(event);
                for action in actions {
                    self.run_action(group, action);
                }
                if terminate {
                    info!(id = %format_args!("{:x}", group), "removing mount group");
                    self.groups.remove(&group);
                }
            }
            BusEvent::CheckpointLoaded { group, resources } => {
                let Some(g) = self.groups.get_mut(&group) else {
                    return;
                };
                g.install_checkpoint(resources);
            }
        }
    }

    fn run_action(&mut self, id: GroupId, action: RecoveryAction) {
        let Some(g) = self.groups.get_mut(&id) else {
            return;
        };
        match action {
            RecoveryAction::StoreCheckpoint { joiner } => {
                let name = g.checkpoint_name();
                if g.ckpt_owned && !g.dirty {
                    debug!(checkpoint = %name, "stored checkpoint is up to date");
                } else {
                    let sections = checkpoint::pack_group(g);
                    g.dirty = false;
                    let store = Arc::clone(&self.snapshots);
                    tokio::spawn(async move {
                        if let Err(e) =
                            checkpoint::store_locks(store.as_ref(), &name, &sections).await
                        {
                            error!(checkpoint = %name, error = %e, "checkpoint store failed");
                        }
                    });
                }
                // if the joiner becomes the low node it takes over
                // checkpoint duty; close our handle
                g.ckpt_owned = joiner > g.node_id();
            }
            RecoveryAction::RetrieveCheckpoint => {
                let name = g.checkpoint_name();
                let ownership = g.tuning.ownership;
                let unlink_after = g.is_master();
                let store = Arc::clone(&self.snapshots);
                let tx = self.bus_tx.clone();
                tokio::spawn(async move {
                    let resources =
                        match checkpoint::retrieve_locks(store.as_ref(), &name, ownership, unlink_after)
                            .await
                        {
                            Ok(resources) => resources,
                            Err(e) => {
                                // proceed without full visibility; the next
                                // store cycle repairs it
                                error!(checkpoint = %name, error = %e, "checkpoint retrieve failed");
                                Vec::new()
                            }
                        };
                    let _ = tx
                        .send(BusEvent::CheckpointLoaded {
                            group: id,
                            resources,
                        })
                        .await;
                });
            }
            RecoveryAction::UnlinkCheckpoint => {
                let name = g.checkpoint_name();
                let store = Arc::clone(&self.snapshots);
                tokio::spawn(async move {
                    if let Err(e) =
                        checkpoint::retry_busy("unlink", || store.unlink(&name)).await
                    {
                        error!(checkpoint = %name, error = %e, "checkpoint unlink failed");
                    }
                });
            }
        }
    }

    fn handle_tick(&mut self) {
        if self.rate_limited() {
            observability::record_rate_delay();
        }
        let now = Instant::now();
        for g in self.groups.values_mut() {
            g.drop_sweep(now);
        }
        for g in self.groups.values() {
            observability::update_resource_count(g.name(), g.resource_count());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::{SnapshotAttrs, SnapshotError};
    use crate::error::Result;
    use crate::types::{LockOp, OpKind};
    use async_trait::async_trait;
    use std::collections::HashMap as StdHashMap;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Sent(Mutex<Vec<Message>>);

    impl Broadcast for Sent {
        fn send(&self, msg: &Message) -> Result<()> {
            self.0.lock().unwrap().push(*msg);
            Ok(())
        }
    }

    #[derive(Default)]
    struct Results(Mutex<Vec<OpRecord>>);

    impl ResultSink for Results {
        fn write_result(&self, rec: &OpRecord) -> Result<()> {
            self.0.lock().unwrap().push(*rec);
            Ok(())
        }
    }

    #[derive(Default)]
    struct MemStore {
        sections: Mutex<StdHashMap<String, Vec<(String, Vec<u8>)>>>,
    }

    #[async_trait]
    impl SnapshotStore for MemStore {
        async fn create(&self, name: &str, _attrs: SnapshotAttrs) -> std::result::Result<(), SnapshotError> {
            let mut all = self.sections.lock().unwrap();
            if all.contains_key(name) {
                return Err(SnapshotError::Exists);
            }
            all.insert(name.to_string(), Vec::new());
            Ok(())
        }

        async fn unlink(&self, name: &str) -> std::result::Result<(), SnapshotError> {
            self.sections.lock().unwrap().remove(name);
            Ok(())
        }

        async fn write_section(
            &self,
            name: &str,
            id: &str,
            data: &[u8],
        ) -> std::result::Result<(), SnapshotError> {
            let mut all = self.sections.lock().unwrap();
            let ckpt = all.get_mut(name).ok_or(SnapshotError::Missing)?;
            if ckpt.iter().any(|(i, _)| i == id) {
                return Err(SnapshotError::Exists);
            }
            ckpt.push((id.to_string(), data.to_vec()));
            Ok(())
        }

        async fn sections(&self, name: &str) -> std::result::Result<Vec<String>, SnapshotError> {
            let all = self.sections.lock().unwrap();
            let ckpt = all.get(name).ok_or(SnapshotError::Missing)?;
            Ok(ckpt.iter().map(|(i, _)| i.clone()).collect())
        }

        async fn read_section(
            &self,
            name: &str,
            id: &str,
        ) -> std::result::Result<Vec<u8>, SnapshotError> {
            let all = self.sections.lock().unwrap();
            let ckpt = all.get(name).ok_or(SnapshotError::Missing)?;
            ckpt.iter()
                .find(|(i, _)| i == id)
                .map(|(_, d)| d.clone())
                .ok_or(SnapshotError::Missing)
        }
    }

    struct Fixture {
        daemon: Daemon,
        results: Arc<Results>,
        sent: Arc<Sent>,
    }

    fn fixture() -> Fixture {
        let (_kernel_tx, kernel_rx) = mpsc::channel(16);
        let (bus_tx, bus_rx) = mpsc::channel(16);
        let results = Arc::new(Results::default());
        let sent = Arc::new(Sent::default());
        let daemon = Daemon::new(
            PlockConfig::development(),
            Arc::clone(&sent) as Arc<dyn Broadcast>,
            Arc::clone(&results) as Arc<dyn ResultSink>,
            Arc::new(MemStore::default()) as Arc<dyn SnapshotStore>,
            kernel_rx,
            bus_rx,
            bus_tx,
        );
        Fixture {
            daemon,
            results,
            sent,
        }
    }

    fn kernel_record(fsid: u32, number: u64) -> OpRecord {
        let op = LockOp {
            kind: OpKind::Lock,
            number,
            start: 0,
            end: 9,
            exclusive: true,
            wait: false,
            node: 0,
            pid: 100,
            owner: 0x1,
        };
        OpRecord::from_op(fsid, &op, 0)
    }

    #[tokio::test]
    async fn test_unknown_group_gets_result() {
        let mut f = fixture();
        f.daemon.handle_kernel(kernel_record(0x99, 1));

        let results = f.results.0.lock().unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].rv, -libc::EEXIST);
    }

    #[tokio::test]
    async fn test_disabled_plocks_get_enosys() {
        let mut f = fixture();
        f.daemon.cfg.plock.enabled = false;
        f.daemon.add_group(5, "gfs0", JoinPhase::Synced);
        f.daemon.handle_kernel(kernel_record(5, 1));

        let results = f.results.0.lock().unwrap();
        assert_eq!(results[0].rv, -libc::ENOSYS);
    }

    #[tokio::test]
    async fn test_kernel_op_reaches_group_and_broadcasts() {
        let mut f = fixture();
        f.daemon.cfg.plock.ownership = false;
        f.daemon.add_group(5, "gfs0", JoinPhase::Synced);
        f.daemon.handle_kernel(kernel_record(5, 1));

        let sent = f.sent.0.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].group, 5);
        // the origin was stamped with our node id
        assert_eq!(sent[0].op.node, 1);
    }

    #[tokio::test]
    async fn test_bad_optype_gets_einval() {
        let mut f = fixture();
        f.daemon.add_group(5, "gfs0", JoinPhase::Synced);
        let mut rec = kernel_record(5, 1);
        rec.optype = 0;
        f.daemon.handle_kernel(rec);

        let results = f.results.0.lock().unwrap();
        assert_eq!(results[0].rv, -libc::EINVAL);
    }

    #[tokio::test]
    async fn test_join_retrieve_roundtrip() {
        // master node stores, joiner retrieves through the same in-memory
        // snapshot service
        let (_kernel_tx, kernel_rx) = mpsc::channel(16);
        let (bus_tx, mut bus_rx) = mpsc::channel(16);
        let store = Arc::new(MemStore::default());
        let results = Arc::new(Results::default());
        let sent = Arc::new(Sent::default());

        let mut cfg = PlockConfig::development();
        cfg.plock.ownership = false;
        let mut master = Daemon::new(
            cfg,
            Arc::clone(&sent) as Arc<dyn Broadcast>,
            Arc::clone(&results) as Arc<dyn ResultSink>,
            Arc::clone(&store) as Arc<dyn SnapshotStore>,
            kernel_rx,
            mpsc::channel(1).1,
            bus_tx.clone(),
        );
        master.add_group(5, "gfs0", JoinPhase::Synced);
        master.handle_bus(BusEvent::Membership {
            group: 5,
            event: MembershipEvent::Start {
                members: vec![1],
                joined: vec![1],
                departed: vec![],
                seq: 1,
            },
        });
        // node 1 is alone, so its own join retrieves an empty checkpoint
        let loaded = bus_rx.recv().await.unwrap();
        master.handle_bus(loaded);

        // place one lock, then store for joiner node 2
        let op = LockOp {
            kind: OpKind::Lock,
            number: 9,
            start: 0,
            end: 99,
            exclusive: true,
            wait: false,
            node: 1,
            pid: 10,
            owner: 0x1,
        };
        master.handle_bus(BusEvent::Delivered(Message::plock(5, 1, &op)));
        master.handle_bus(BusEvent::Membership {
            group: 5,
            event: MembershipEvent::Start {
                members: vec![1, 2],
                joined: vec![2],
                departed: vec![],
                seq: 2,
            },
        });
        // let the spawned store task finish
        tokio::time::sleep(Duration::from_millis(50)).await;

        // the joiner comes up against the same snapshot service
        let (jbus_tx, mut jbus_rx) = mpsc::channel(16);
        let mut jcfg = PlockConfig::development();
        jcfg.node.id = 2;
        jcfg.plock.ownership = false;
        let mut joiner = Daemon::new(
            jcfg,
            Arc::new(Sent::default()) as Arc<dyn Broadcast>,
            Arc::new(Results::default()) as Arc<dyn ResultSink>,
            Arc::clone(&store) as Arc<dyn SnapshotStore>,
            mpsc::channel(1).1,
            mpsc::channel(1).1,
            jbus_tx,
        );
        joiner.add_group(5, "gfs0", JoinPhase::Ignoring);
        joiner.handle_bus(BusEvent::Membership {
            group: 5,
            event: MembershipEvent::Start {
                members: vec![1, 2],
                joined: vec![2],
                departed: vec![],
                seq: 2,
            },
        });
        let loaded = jbus_rx.recv().await.unwrap();
        joiner.handle_bus(loaded);

        let g = joiner.group(5).unwrap();
        let r = g.resource(9).unwrap();
        assert_eq!(r.locks.len(), 1);
        assert_eq!(r.locks[0].end, 99);
        drop(bus_tx);
    }
}
