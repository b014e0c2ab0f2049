//! Lock resources and the per-group resource table.
//!
//! A [`Resource`] holds everything the protocol knows about one lockable
//! object: the held ranges, the waiter queue, operations parked until
//! ownership resolves, and the ownership state itself. The
//! [`ResourceTable`] exclusively owns every resource of a mount group; all
//! mutation happens on the group's single logical thread, so no internal
//! locking is needed.

use crate::types::{LockOp, LockWaiter, NodeId, OwnerState, PosixLock, ResourceId};
use std::collections::HashMap;
use std::time::Instant;

/// Per-resource lock state.
#[derive(Debug, Clone)]
pub struct Resource {
    /// Stable resource number; never reused while locks exist.
    pub number: ResourceId,
    /// Ownership state.
    pub owner: OwnerState,
    /// Held ranges. Entries of the same lineage never overlap.
    pub locks: Vec<PosixLock>,
    /// Requests blocked on a conflict, FIFO.
    pub waiters: Vec<LockWaiter>,
    /// Local operations deferred until ownership resolves.
    pub pending: Vec<LockOp>,
    /// Last time the resource was referenced; drives the drop sweep.
    pub last_access: Instant,
}

impl Resource {
    /// Create an empty resource in the given ownership state.
    pub fn new(number: ResourceId, owner: OwnerState) -> Self {
        Self {
            number,
            owner,
            locks: Vec::new(),
            waiters: Vec::new(),
            pending: Vec::new(),
            last_access: Instant::now(),
        }
    }

    /// True when the resource holds no locks and no waiters.
    ///
    /// Idleness is the drop criterion and must be derived only from state
    /// that is identical on every member.
    pub fn is_idle(&self) -> bool {
        self.locks.is_empty() && self.waiters.is_empty()
    }

    fn touch(&mut self) {
        self.last_access = Instant::now();
    }
}

/// The set of resources of one mount group, keyed by resource number.
#[derive(Debug)]
pub struct ResourceTable {
    resources: HashMap<ResourceId, Resource>,
    ownership: bool,
}

impl ResourceTable {
    /// Create an empty table. `ownership` selects the owner state new
    /// resources start in and whether idle resources are freed eagerly.
    pub fn new(ownership: bool) -> Self {
        Self {
            resources: HashMap::new(),
            ownership,
        }
    }

    /// Whether the ownership optimization is active.
    pub fn ownership(&self) -> bool {
        self.ownership
    }

    /// Look up a resource without touching its access time.
    pub fn get(&self, number: ResourceId) -> Option<&Resource> {
        self.resources.get(&number)
    }

    /// Look up a resource for mutation, refreshing its access time.
    pub fn get_mut(&mut self, number: ResourceId) -> Option<&mut Resource> {
        let r = self.resources.get_mut(&number)?;
        r.touch();
        Some(r)
    }

    /// Find a resource, creating it on first reference.
    ///
    /// With ownership active a new resource starts `Resolving` (its owner
    /// must be discovered); otherwise it is born unowned and replicated.
    pub fn find_or_create(&mut self, number: ResourceId) -> &mut Resource {
        let owner = if self.ownership {
            OwnerState::Resolving
        } else {
            OwnerState::Unowned { acked: false }
        };
        let r = self
            .resources
            .entry(number)
            .or_insert_with(|| Resource::new(number, owner));
        r.touch();
        r
    }

    /// Insert a fully formed resource, e.g. one unpacked from a checkpoint.
    pub fn insert(&mut self, resource: Resource) {
        self.resources.insert(resource.number, resource);
    }

    /// Remove a resource outright.
    pub fn remove(&mut self, number: ResourceId) -> Option<Resource> {
        self.resources.remove(&number)
    }

    /// Free the resource if it is idle and the ownership model is off.
    ///
    /// Ownership-model resources stay alive until the explicit drop
    /// handshake completes, amortizing the ownership-transfer cost.
    pub fn release_if_idle(&mut self, number: ResourceId) {
        if self.ownership {
            return;
        }
        if let Some(r) = self.resources.get(&number) {
            if r.is_idle() {
                self.resources.remove(&number);
            }
        }
    }

    /// Number of resources in the table.
    pub fn len(&self) -> usize {
        self.resources.len()
    }

    /// True when the table is empty.
    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    /// Iterate all resources.
    pub fn iter(&self) -> impl Iterator<Item = &Resource> {
        self.resources.values()
    }

    /// Iterate all resources mutably.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Resource> {
        self.resources.values_mut()
    }

    /// Snapshot of all resource numbers.
    pub fn numbers(&self) -> Vec<ResourceId> {
        self.resources.keys().copied().collect()
    }
}
