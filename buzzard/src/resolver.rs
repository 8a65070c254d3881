use std::collections::BTreeMap;
use std::os::unix::fs::MetadataExt;
use std::path::PathBuf;

use buzzard_ebpf_common::policy::CgroupId;
use buzzard_store::short_id;
use futures::future::join_all;
use tracing::{debug, warn};

use crate::runtime::ProcessInspector;

/// Cgroup root as seen from inside the container's mount namespace.
const CGROUP_ROOT: &str = "root/sys/fs/cgroup";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Resolution {
    Found(CgroupId),
    /// Not running, unknown to the runtime, or exited while being inspected.
    NotFound,
}

/// Maps container identities to the cgroup inode the enforcement hooks key on.
pub struct CgroupResolver<P> {
    inspector: P,
    proc_root: PathBuf,
}

impl<P: ProcessInspector> CgroupResolver<P> {
    pub fn new(inspector: P, proc_root: impl Into<PathBuf>) -> Self {
        Self {
            inspector,
            proc_root: proc_root.into(),
        }
    }

    pub async fn resolve(&self, container_id: &str) -> Resolution {
        let pid = match self.inspector.pid_for(container_id).await {
            Ok(Some(pid)) if pid != 0 => pid,
            Ok(_) => {
                debug!(container = short_id(container_id), "container not running");
                return Resolution::NotFound;
            }
            Err(e) => {
                debug!(%e, container = short_id(container_id), "process lookup failed");
                return Resolution::NotFound;
            }
        };

        let path = self.proc_root.join(pid.to_string()).join(CGROUP_ROOT);
        match tokio::fs::metadata(&path).await {
            Ok(meta) => Resolution::Found(meta.ino()),
            Err(e) => {
                warn!(%e, container = short_id(container_id), pid, path = %path.display(), "failed to stat cgroup root");
                Resolution::NotFound
            }
        }
    }

    /// Resolves every identity, keeping only the ones found this cycle.
    pub async fn resolve_all<'a, I>(&self, container_ids: I) -> BTreeMap<String, CgroupId>
    where
        I: IntoIterator<Item = &'a String>,
    {
        let lookups = container_ids
            .into_iter()
            .map(|container_id| async move { (container_id, self.resolve(container_id).await) });
        join_all(lookups)
            .await
            .into_iter()
            .filter_map(|(container_id, resolution)| match resolution {
                Resolution::Found(inode) => Some((container_id.clone(), inode)),
                Resolution::NotFound => None,
            })
            .collect()
    }
}

#[cfg(test)]
mod test {
    use std::collections::HashMap;
    use std::fs;

    use super::*;
    use crate::{Error, Result};

    struct FakeInspector(HashMap<String, Result<Option<u32>, String>>);

    impl ProcessInspector for FakeInspector {
        async fn pid_for(&self, container_id: &str) -> Result<Option<u32>> {
            match self.0.get(container_id) {
                Some(Ok(pid)) => Ok(*pid),
                Some(Err(e)) => Err(Error::DockerApi(e.clone())),
                None => Ok(None),
            }
        }
    }

    fn resolver(
        proc_root: &std::path::Path,
        pids: &[(&str, Result<Option<u32>, String>)],
    ) -> CgroupResolver<FakeInspector> {
        let map = pids
            .iter()
            .map(|(id, pid)| (id.to_string(), pid.clone()))
            .collect();
        CgroupResolver::new(FakeInspector(map), proc_root)
    }

    #[tokio::test]
    async fn test_resolve_running_container() -> Result<()> {
        let proc_root = tempfile::tempdir()?;
        let cgroup = proc_root.path().join("4242").join(CGROUP_ROOT);
        fs::create_dir_all(&cgroup)?;
        let expected = fs::metadata(&cgroup)?.ino();

        let resolver = resolver(proc_root.path(), &[("a", Ok(Some(4242)))]);
        assert_eq!(resolver.resolve("a").await, Resolution::Found(expected));
        Ok(())
    }

    #[tokio::test]
    async fn test_resolve_not_running_is_not_found() -> Result<()> {
        let proc_root = tempfile::tempdir()?;
        let resolver = resolver(
            proc_root.path(),
            &[
                ("stopped", Ok(Some(0))),
                ("exited", Ok(None)),
                ("broken", Err("connection refused".into())),
            ],
        );
        assert_eq!(resolver.resolve("stopped").await, Resolution::NotFound);
        assert_eq!(resolver.resolve("exited").await, Resolution::NotFound);
        assert_eq!(resolver.resolve("broken").await, Resolution::NotFound);
        assert_eq!(resolver.resolve("unknown").await, Resolution::NotFound);
        Ok(())
    }

    #[tokio::test]
    async fn test_resolve_process_gone_is_not_found() -> Result<()> {
        let proc_root = tempfile::tempdir()?;
        let resolver = resolver(proc_root.path(), &[("a", Ok(Some(99)))]);
        assert_eq!(resolver.resolve("a").await, Resolution::NotFound);
        Ok(())
    }

    #[tokio::test]
    async fn test_resolve_all_keeps_found_only() -> Result<()> {
        let proc_root = tempfile::tempdir()?;
        fs::create_dir_all(proc_root.path().join("10").join(CGROUP_ROOT))?;
        let resolver = resolver(proc_root.path(), &[("a", Ok(Some(10))), ("b", Ok(Some(0)))]);

        let ids = vec!["a".to_string(), "b".to_string()];
        let resolved = resolver.resolve_all(&ids).await;
        assert_eq!(resolved.keys().collect::<Vec<_>>(), vec!["a"]);
        Ok(())
    }
}
