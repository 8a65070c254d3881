pub mod policy;
pub mod tc;

use std::borrow::BorrowMut;
use std::error::Error as _;
use std::hash::Hash;
use std::io;
use std::path::Path;

use aya::Pod;
use aya::maps::{HashMap, Map, MapData, MapError};
use buzzard_ebpf_common::policy::{PolicyValue, Slot};
use nix::sys::resource::{RLIM_INFINITY, Resource, setrlimit};

use crate::Result;

pub type PolicyMap = HashMap<MapData, Slot, PolicyValue>;

pub trait BpfMap<K, V> {
    /// Inserts or overwrites the value under `key`.
    fn update(&mut self, key: K, value: V) -> Result<()>;
    /// Removes `key`. Removing a key that is not present succeeds.
    fn delete(&mut self, key: &K) -> Result<()>;
    fn get_state(&self) -> Result<ahash::HashMap<K, V>>;
}

impl<T: BorrowMut<MapData>, K: Pod + Eq + Hash, V: Pod> BpfMap<K, V> for HashMap<T, K, V> {
    fn update(&mut self, key: K, value: V) -> Result<()> {
        Ok(self.insert(key, value, 0)?)
    }
    fn delete(&mut self, key: &K) -> Result<()> {
        match self.remove(key) {
            Err(e) if is_missing_key(&e) => Ok(()),
            res => Ok(res?),
        }
    }
    fn get_state(&self) -> Result<ahash::HashMap<K, V>> {
        let mut map = ahash::HashMap::default();
        for entry in self.iter() {
            let (k, v) = entry?;
            map.insert(k, v);
        }
        Ok(map)
    }
}

impl<K: Eq + Hash + Clone, V: Clone> BpfMap<K, V> for ahash::HashMap<K, V> {
    fn update(&mut self, key: K, value: V) -> Result<()> {
        self.insert(key, value);
        Ok(())
    }
    fn delete(&mut self, key: &K) -> Result<()> {
        self.remove(key);
        Ok(())
    }
    fn get_state(&self) -> Result<ahash::HashMap<K, V>> {
        Ok(self.clone())
    }
}

/// The kernel reports a delete of an absent key either as `KeyNotFound` or as
/// a syscall error carrying `ENOENT`.
fn is_missing_key(err: &MapError) -> bool {
    if matches!(err, MapError::KeyNotFound) {
        return true;
    }
    let mut source: Option<&(dyn std::error::Error + 'static)> = err.source();
    while let Some(e) = source {
        if let Some(io_err) = e.downcast_ref::<io::Error>()
            && io_err.kind() == io::ErrorKind::NotFound
        {
            return true;
        }
        source = e.source();
    }
    false
}

/// Opens the policy table pinned by the loader of the enforcement programs.
pub fn load_policy_map(pin: &Path) -> Result<PolicyMap> {
    let data = MapData::from_pin(pin)?;
    Ok(PolicyMap::try_from(Map::HashMap(data))?)
}

/// Lifts the locked memory limit so map and program creation is not refused
/// on kernels that still account BPF memory against `RLIMIT_MEMLOCK`.
pub fn remove_memlock() -> Result<()> {
    setrlimit(Resource::RLIMIT_MEMLOCK, RLIM_INFINITY, RLIM_INFINITY)?;
    Ok(())
}
