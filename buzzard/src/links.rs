//! Host network links as listed under `/sys/class/net`.

use std::collections::HashSet;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use buzzard_store::Interfaces;
use tracing::debug;

use crate::Result;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinkKind {
    /// One end of a virtual ethernet pair.
    Veth,
    Other,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Link {
    pub name: String,
    pub index: u32,
    pub kind: LinkKind,
}

pub trait HostLinks {
    /// Every link currently present on the host, ordered by name.
    fn list(&self) -> Result<Vec<Link>>;

    /// Host interface index of `name`, `None` once the link is gone.
    fn index_of(&self, name: &str) -> Option<u32>;
}

/// Reads links from a sysfs `class/net` directory.
#[derive(Clone, Debug)]
pub struct SysfsLinks {
    root: PathBuf,
    prefix: String,
}

impl SysfsLinks {
    pub fn new(root: impl Into<PathBuf>, prefix: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            prefix: prefix.into(),
        }
    }

    /// Container side veth links, as recorded alongside each lifecycle event.
    pub fn container_interfaces(&self) -> Result<Interfaces> {
        let links = self.list()?;
        Ok(Interfaces::new(
            links
                .into_iter()
                .filter(|l| l.kind == LinkKind::Veth && l.name.starts_with(&self.prefix))
                .map(|l| l.name),
        ))
    }

    /// Names of every link present on the host.
    pub fn names(&self) -> Result<HashSet<String>> {
        Ok(self.list()?.into_iter().map(|l| l.name).collect())
    }
}

impl HostLinks for SysfsLinks {
    fn list(&self) -> Result<Vec<Link>> {
        list_interfaces(&self.root)
    }

    fn index_of(&self, name: &str) -> Option<u32> {
        if name.is_empty() || name.contains('/') {
            return None;
        }
        read_index(&self.root.join(name), "ifindex")
    }
}

pub fn list_interfaces(sys_class_net: &Path) -> Result<Vec<Link>> {
    let mut links = Vec::new();
    for entry in fs::read_dir(sys_class_net)? {
        let entry = entry?;
        let Some(name) = entry.file_name().to_str().map(str::to_string) else {
            continue;
        };
        let dir = entry.path();
        // a link removed while listing has no attributes left
        let Some(index) = read_index(&dir, "ifindex") else {
            debug!(link = %name, "skipping link without ifindex");
            continue;
        };
        let kind = match read_index(&dir, "iflink") {
            Some(peer) if peer != index && !dir.join("device").exists() => LinkKind::Veth,
            _ => LinkKind::Other,
        };
        links.push(Link { name, index, kind });
    }
    links.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(links)
}

fn read_index(dir: &Path, attr: &str) -> Option<u32> {
    match fs::read_to_string(dir.join(attr)) {
        Ok(value) => value.trim().parse().ok(),
        Err(e) if e.kind() == ErrorKind::NotFound => None,
        Err(e) => {
            debug!(%e, path = %dir.display(), attr, "failed to read link attribute");
            None
        }
    }
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;

    /// Writes a fake sysfs link directory.
    pub(crate) fn add_link(root: &Path, name: &str, index: u32, iflink: u32) {
        let dir = root.join(name);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("ifindex"), format!("{index}\n")).unwrap();
        fs::write(dir.join("iflink"), format!("{iflink}\n")).unwrap();
    }

    #[test]
    fn test_list_interfaces_classifies_veth() -> Result<()> {
        let root = tempfile::tempdir()?;
        add_link(root.path(), "lo", 1, 1);
        add_link(root.path(), "eth0", 2, 2);
        fs::create_dir_all(root.path().join("eth0/device"))?;
        add_link(root.path(), "veth1a2b", 7, 6);
        add_link(root.path(), "docker0", 3, 3);

        let links = list_interfaces(root.path())?;
        let names: Vec<_> = links.iter().map(|l| l.name.as_str()).collect();
        assert_eq!(names, vec!["docker0", "eth0", "lo", "veth1a2b"]);
        assert_eq!(links[3].kind, LinkKind::Veth);
        assert_eq!(links[3].index, 7);
        assert!(links[..3].iter().all(|l| l.kind == LinkKind::Other));
        Ok(())
    }

    #[test]
    fn test_container_interfaces_filters_prefix() -> Result<()> {
        let root = tempfile::tempdir()?;
        add_link(root.path(), "veth9", 9, 8);
        add_link(root.path(), "veth3", 3, 2);
        add_link(root.path(), "cali42", 4, 5);

        let links = SysfsLinks::new(root.path(), "veth");
        assert_eq!(links.container_interfaces()?.to_delimited(), "veth3,veth9");
        Ok(())
    }

    #[test]
    fn test_index_of_vanished_link() -> Result<()> {
        let root = tempfile::tempdir()?;
        add_link(root.path(), "veth0", 12, 11);
        let links = SysfsLinks::new(root.path(), "veth");
        assert_eq!(links.index_of("veth0"), Some(12));

        fs::remove_dir_all(root.path().join("veth0"))?;
        assert_eq!(links.index_of("veth0"), None);
        assert_eq!(links.index_of("../veth0"), None);
        Ok(())
    }
}
