//! Slot allocation and synchronization of the cgroup policy table.

use std::collections::{BTreeMap, BTreeSet};

use buzzard_ebpf_common::policy::{CgroupId, POLICY_MAP_MAX_ENTRIES, PolicyValue, Slot};
use buzzard_store::short_id;
use tracing::{debug, error, info, warn};

use crate::bpf::BpfMap;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PolicyOp {
    Put {
        container_id: String,
        slot: Slot,
        value: PolicyValue,
    },
    Delete {
        container_id: String,
        slot: Slot,
    },
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub written: usize,
    pub deleted: usize,
    /// Desired identities without a cgroup this cycle.
    pub unresolved: usize,
    /// Desired identities holding a slot the enforcement hooks do not scan.
    pub beyond_capacity: usize,
    pub failed: usize,
}

/// Owns the slot assignment and is the only writer of the policy table.
pub struct PolicySync<M> {
    map: M,
    slots: BTreeMap<String, Slot>,
    /// `None` once every slot number has been handed out.
    next_slot: Option<Slot>,
}

impl<M: BpfMap<Slot, PolicyValue>> PolicySync<M> {
    pub fn new(map: M) -> Self {
        Self {
            map,
            slots: BTreeMap::new(),
            next_slot: Some(0),
        }
    }

    pub fn slots(&self) -> &BTreeMap<String, Slot> {
        &self.slots
    }

    pub fn map(&self) -> &M {
        &self.map
    }

    /// Gives every desired identity without a slot the next unused one.
    /// Slot numbers are never handed out twice; once they run out, new
    /// identities stay without a slot.
    pub fn assign_slots(&mut self, desired: &BTreeSet<String>) {
        for container_id in desired {
            if self.slots.contains_key(container_id) {
                continue;
            }
            let Some(slot) = self.next_slot else {
                error!(container = short_id(container_id), "slot numbers exhausted");
                continue;
            };
            self.next_slot = slot.checked_add(1);
            if slot >= POLICY_MAP_MAX_ENTRIES {
                warn!(
                    container = short_id(container_id),
                    slot,
                    capacity = POLICY_MAP_MAX_ENTRIES,
                    "assigned slot beyond the range the enforcement hooks scan"
                );
            } else {
                debug!(container = short_id(container_id), slot, "assigned slot");
            }
            self.slots.insert(container_id.clone(), slot);
        }
    }

    /// Table operations for one cycle, given the current assignment.
    ///
    /// Resolved identities get their entry rewritten unconditionally,
    /// unresolved ones keep whatever entry they had, and identities that are no
    /// longer desired get their entry deleted.
    pub fn plan(
        &self,
        desired: &BTreeSet<String>,
        resolved: &BTreeMap<String, CgroupId>,
    ) -> Vec<PolicyOp> {
        let mut ops = Vec::new();
        for (container_id, slot) in &self.slots {
            if !desired.contains(container_id) {
                ops.push(PolicyOp::Delete {
                    container_id: container_id.clone(),
                    slot: *slot,
                });
            } else if let Some(cgroup_id) = resolved.get(container_id) {
                ops.push(PolicyOp::Put {
                    container_id: container_id.clone(),
                    slot: *slot,
                    value: PolicyValue::from(*cgroup_id),
                });
            }
        }
        ops
    }

    pub fn sync(
        &mut self,
        desired: &BTreeSet<String>,
        resolved: &BTreeMap<String, CgroupId>,
    ) -> SyncReport {
        self.assign_slots(desired);
        let ops = self.plan(desired, resolved);

        let mut report = SyncReport {
            unresolved: desired.iter().filter(|id| !resolved.contains_key(*id)).count(),
            beyond_capacity: desired
                .iter()
                .filter_map(|id| self.slots.get(id))
                .filter(|slot| **slot >= POLICY_MAP_MAX_ENTRIES)
                .count(),
            ..Default::default()
        };
        for op in ops {
            self.apply(op, &mut report);
        }
        report
    }

    fn apply(&mut self, op: PolicyOp, report: &mut SyncReport) {
        match op {
            PolicyOp::Put {
                container_id,
                slot,
                value,
            } => match self.map.update(slot, value) {
                Ok(()) => {
                    debug!(container = short_id(&container_id), slot, %value, "wrote policy entry");
                    report.written += 1;
                }
                Err(e) => {
                    warn!(
                        %e,
                        container = short_id(&container_id),
                        slot,
                        populated = self.slots.len(),
                        capacity = POLICY_MAP_MAX_ENTRIES,
                        "failed to write policy entry"
                    );
                    report.failed += 1;
                }
            },
            // the slot stays assigned until its entry is gone so the delete is retried
            PolicyOp::Delete { container_id, slot } => match self.map.delete(&slot) {
                Ok(()) => {
                    info!(container = short_id(&container_id), slot, "released slot");
                    self.slots.remove(&container_id);
                    report.deleted += 1;
                }
                Err(e) => {
                    warn!(
                        %e,
                        container = short_id(&container_id),
                        slot,
                        "failed to delete policy entry"
                    );
                    report.failed += 1;
                }
            },
        }
    }

    /// Deletes every entry this process populated. Returns the number of failures.
    pub fn release_all(&mut self) -> usize {
        let mut report = SyncReport::default();
        let ops: Vec<_> = self
            .slots
            .iter()
            .map(|(container_id, slot)| PolicyOp::Delete {
                container_id: container_id.clone(),
                slot: *slot,
            })
            .collect();
        for op in ops {
            self.apply(op, &mut report);
        }
        report.failed
    }
}
