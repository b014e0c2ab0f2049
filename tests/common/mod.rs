// Shared multi-node simulation harness for integration tests.
//
// Simulates the reliable broadcast transport as one totally ordered queue:
// every message any node sends is appended, and delivery hands each message
// to every node in queue order, the sender included. That is exactly the
// delivery contract the protocol requires, so N simulated nodes must
// converge on identical lock state.

use async_trait::async_trait;
use plockd::checkpoint::{SnapshotAttrs, SnapshotError, SnapshotStore};
use plockd::config::PlockTuning;
use plockd::group::{JoinPhase, MountGroup};
use plockd::kernel::ResultSink;
use plockd::proto::{Message, OpRecord};
use plockd::recovery::MembershipEvent;
use plockd::transport::Broadcast;
use plockd::types::{LockOp, NodeId, OpKind, ResourceId};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const GROUP_ID: u32 = 7;

/// The shared totally ordered message queue, carrying encoded frames so
/// every delivery exercises the wire codec.
type BusQueue = Arc<Mutex<VecDeque<Vec<u8>>>>;

struct BusSender {
    queue: BusQueue,
}

impl Broadcast for BusSender {
    fn send(&self, msg: &Message) -> plockd::Result<()> {
        self.queue.lock().unwrap().push_back(msg.encode().to_vec());
        Ok(())
    }
}

/// Collects kernel result records written by one node.
#[derive(Default)]
pub struct Results(pub Mutex<Vec<OpRecord>>);

impl ResultSink for Results {
    fn write_result(&self, rec: &OpRecord) -> plockd::Result<()> {
        self.0.lock().unwrap().push(*rec);
        Ok(())
    }
}

pub struct SimNode {
    pub group: MountGroup,
    pub results: Arc<Results>,
    pub alive: bool,
}

pub struct SimCluster {
    pub nodes: Vec<SimNode>,
    queue: BusQueue,
}

pub struct ClusterBuilder {
    nodes: usize,
    ownership: bool,
}

impl ClusterBuilder {
    pub fn new(nodes: usize) -> Self {
        Self {
            nodes,
            ownership: false,
        }
    }

    pub fn ownership(mut self, on: bool) -> Self {
        self.ownership = on;
        self
    }

    pub fn build(self) -> SimCluster {
        let queue: BusQueue = Arc::new(Mutex::new(VecDeque::new()));
        let members: Vec<NodeId> = (1..=self.nodes as NodeId).collect();

        let tuning = PlockTuning {
            ownership: self.ownership,
            rate_limit: 0,
            drop_interval: Duration::ZERO,
            drop_age: Duration::ZERO,
            ..PlockTuning::default()
        };

        let nodes = members
            .iter()
            .map(|&id| {
                let results = Arc::new(Results::default());
                let mut group = MountGroup::new(
                    GROUP_ID,
                    "gfs0",
                    id,
                    tuning.clone(),
                    JoinPhase::Synced,
                    Arc::new(BusSender {
                        queue: Arc::clone(&queue),
                    }) as Arc<dyn Broadcast>,
                    Arc::clone(&results) as Arc<dyn ResultSink>,
                );
                group.apply_membership(MembershipEvent::Start {
                    members: members.clone(),
                    joined: vec![],
                    departed: vec![],
                    seq: 1,
                });
                SimNode {
                    group,
                    results,
                    alive: true,
                }
            })
            .collect();

        SimCluster { nodes, queue }
    }
}

impl SimCluster {
    /// The node with the given id (ids start at 1).
    pub fn node(&mut self, id: NodeId) -> &mut MountGroup {
        &mut self.nodes[id as usize - 1].group
    }

    /// Deliver the next queued message to every node, in total order.
    /// Returns false once the queue is empty.
    pub fn step(&mut self) -> bool {
        let frame = self.queue.lock().unwrap().pop_front();
        let Some(frame) = frame else {
            return false;
        };
        let msg = Message::decode(&frame).expect("well-formed frame");
        for node in self.nodes.iter_mut().filter(|n| n.alive) {
            node.group.deliver(msg);
        }
        true
    }

    /// Deliver queued messages until the cluster goes quiet.
    pub fn pump(&mut self) -> usize {
        let mut delivered = 0;
        while self.step() {
            delivered += 1;
        }
        delivered
    }

    /// Apply one membership event on every node, in the same order
    /// relative to the message stream.
    pub fn membership(&mut self, event: MembershipEvent) {
        for node in self.nodes.iter_mut().filter(|n| n.alive) {
            node.group.apply_membership(event.clone());
        }
    }

    /// Take a node out of the cluster; it stops receiving deliveries.
    pub fn fail_node(&mut self, id: NodeId) {
        self.nodes[id as usize - 1].alive = false;
    }

    /// Count of nodes that currently believe they own the resource.
    pub fn self_owner_count(&self, number: ResourceId) -> usize {
        self.nodes
            .iter()
            .filter(|n| n.alive)
            .filter(|n| {
                n.group
                    .resource(number)
                    .map(|r| r.owner.is_self(n.group.node_id()))
                    .unwrap_or(false)
            })
            .count()
    }

    /// Assert every node holds an identical lock table, via the dump text.
    pub fn assert_converged(&self) {
        let dumps: Vec<String> = self
            .nodes
            .iter()
            .filter(|n| n.alive)
            .map(|n| {
                let mut out = Vec::new();
                n.group.dump_locks(&mut out).unwrap();
                String::from_utf8(out).unwrap()
            })
            .collect();
        for pair in dumps.windows(2) {
            assert_eq!(pair[0], pair[1], "nodes diverged");
        }
    }
}

pub fn lock(node: NodeId, number: ResourceId, start: u64, end: u64, ex: bool) -> LockOp {
    LockOp {
        kind: OpKind::Lock,
        number,
        start,
        end,
        exclusive: ex,
        wait: false,
        node,
        pid: node * 100,
        owner: node as u64,
    }
}

pub fn lock_wait(node: NodeId, number: ResourceId, start: u64, end: u64, ex: bool) -> LockOp {
    LockOp {
        wait: true,
        ..lock(node, number, start, end, ex)
    }
}

pub fn unlock(node: NodeId, number: ResourceId, start: u64, end: u64) -> LockOp {
    LockOp {
        kind: OpKind::Unlock,
        ..lock(node, number, start, end, false)
    }
}

/// In-memory stand-in for the replicated checkpoint service.
#[derive(Default)]
pub struct MemSnapshotStore {
    checkpoints: Mutex<HashMap<String, Vec<(String, Vec<u8>)>>>,
}

#[async_trait]
impl SnapshotStore for MemSnapshotStore {
    async fn create(&self, name: &str, _attrs: SnapshotAttrs) -> Result<(), SnapshotError> {
        let mut all = self.checkpoints.lock().unwrap();
        if all.contains_key(name) {
            return Err(SnapshotError::Exists);
        }
        all.insert(name.to_string(), Vec::new());
        Ok(())
    }

    async fn unlink(&self, name: &str) -> Result<(), SnapshotError> {
        self.checkpoints.lock().unwrap().remove(name);
        Ok(())
    }

    async fn write_section(&self, name: &str, id: &str, data: &[u8]) -> Result<(), SnapshotError> {
        let mut all = self.checkpoints.lock().unwrap();
        let ckpt = all.get_mut(name).ok_or(SnapshotError::Missing)?;
        if ckpt.iter().any(|(i, _)| i == id) {
            return Err(SnapshotError::Exists);
        }
        ckpt.push((id.to_string(), data.to_vec()));
        Ok(())
    }

    async fn sections(&self, name: &str) -> Result<Vec<String>, SnapshotError> {
        let all = self.checkpoints.lock().unwrap();
        let ckpt = all.get(name).ok_or(SnapshotError::Missing)?;
        Ok(ckpt.iter().map(|(i, _)| i.clone()).collect())
    }

    async fn read_section(&self, name: &str, id: &str) -> Result<Vec<u8>, SnapshotError> {
        let all = self.checkpoints.lock().unwrap();
        let ckpt = all.get(name).ok_or(SnapshotError::Missing)?;
        ckpt.iter()
            .find(|(i, _)| i == id)
            .map(|(_, d)| d.clone())
            .ok_or(SnapshotError::Missing)
    }
}
