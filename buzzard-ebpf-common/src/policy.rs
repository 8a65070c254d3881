use core::fmt::Display;

/// Key of the policy table. Slots are handed out by userspace and carry no
/// meaning outside of the agent process that allocated them.
pub type Slot = u32;

/// Inode of a container's cgroup root, as returned by
/// `bpf_get_current_cgroup_id()` for tasks inside that container.
pub type CgroupId = u64;

/// Capacity of the policy table. Inserting a new slot into a full table fails.
pub const POLICY_MAP_MAX_ENTRIES: u32 = 64;

/// Pinned name of the policy table under the bpf filesystem.
pub const POLICY_MAP_NAME: &str = "map_container_cgroup_ids";

#[repr(C)]
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Default)]
pub struct PolicyValue {
    pub cgroup_id: CgroupId,
}

impl From<CgroupId> for PolicyValue {
    fn from(cgroup_id: CgroupId) -> Self {
        Self { cgroup_id }
    }
}

impl Display for PolicyValue {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "cgroup:{}", self.cgroup_id)
    }
}

#[cfg(feature = "user")]
unsafe impl aya::Pod for PolicyValue {}
