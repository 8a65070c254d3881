//! Attachment of the TC ingress classifier to container veths.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use aya::programs::tc::{self, SchedClassifierLinkId};
use aya::programs::{SchedClassifier, TcAttachType};
use aya::{Ebpf, EbpfLoader};
use tracing::{debug, info, warn};

use crate::links::HostLinks;
use crate::{Error, Result};

pub trait HookAttacher {
    type Handle;

    fn attach(&mut self, interface: &str) -> Result<Self::Handle>;
    fn detach(&mut self, handle: Self::Handle) -> Result<()>;
}

/// The classifier program loaded from a compiled object, attached on the
/// ingress path of each interface.
pub struct TcIngress {
    ebpf: Ebpf,
    program: String,
}

impl TcIngress {
    /// Loads `program` from `object`. Maps the object declares as pinned are
    /// reused from `pin_dir` instead of being created again.
    pub fn load(object: &Path, program: &str, pin_dir: &Path) -> Result<Self> {
        let mut ebpf = EbpfLoader::new().map_pin_path(pin_dir).load_file(object)?;
        let classifier: &mut SchedClassifier = ebpf
            .program_mut(program)
            .ok_or_else(|| Error::ProgramNotFound {
                name: program.to_string(),
            })?
            .try_into()?;
        if let Err(e) = classifier.load()
            && !matches!(e, aya::programs::ProgramError::AlreadyLoaded)
        {
            return Err(e.into());
        }
        Ok(Self {
            ebpf,
            program: program.to_string(),
        })
    }

    fn classifier(&mut self) -> Result<&mut SchedClassifier> {
        let classifier: &mut SchedClassifier = self
            .ebpf
            .program_mut(&self.program)
            .ok_or_else(|| Error::ProgramNotFound {
                name: self.program.clone(),
            })?
            .try_into()?;
        Ok(classifier)
    }
}

impl HookAttacher for TcIngress {
    type Handle = SchedClassifierLinkId;

    fn attach(&mut self, interface: &str) -> Result<Self::Handle> {
        // fails harmlessly when the interface already has a clsact qdisc
        let _ = tc::qdisc_add_clsact(interface);
        Ok(self.classifier()?.attach(interface, TcAttachType::Ingress)?)
    }

    fn detach(&mut self, handle: Self::Handle) -> Result<()> {
        Ok(self.classifier()?.detach(handle)?)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AttachmentPlan {
    pub attach: Vec<String>,
    pub detach: Vec<String>,
}

impl AttachmentPlan {
    pub fn is_empty(&self) -> bool {
        self.attach.is_empty() && self.detach.is_empty()
    }
}

/// Desired interfaces that are not attached yet, and attached interfaces that
/// are no longer desired. The two sets never overlap.
pub fn plan_attachments<H>(
    desired: &BTreeSet<String>,
    attached: &BTreeMap<String, H>,
) -> AttachmentPlan {
    AttachmentPlan {
        attach: desired
            .iter()
            .filter(|name| !attached.contains_key(*name))
            .cloned()
            .collect(),
        detach: attached
            .keys()
            .filter(|name| !desired.contains(*name))
            .cloned()
            .collect(),
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AttachReport {
    pub attached: usize,
    pub detached: usize,
    /// Interfaces that no longer exist on the host, either before attach or
    /// by the time their hook was released.
    pub vanished: usize,
    pub failed: usize,
}

/// Owns the hook handles of every attached interface.
pub struct Attachments<H: HookAttacher, L> {
    attacher: H,
    links: L,
    attached: BTreeMap<String, H::Handle>,
}

impl<H: HookAttacher, L: HostLinks> Attachments<H, L> {
    pub fn new(attacher: H, links: L) -> Self {
        Self {
            attacher,
            links,
            attached: BTreeMap::new(),
        }
    }

    pub fn attached(&self) -> impl Iterator<Item = &str> {
        self.attached.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.attached.len()
    }

    pub fn is_empty(&self) -> bool {
        self.attached.is_empty()
    }

    pub fn reconcile(&mut self, desired: &BTreeSet<String>) -> AttachReport {
        let plan = plan_attachments(desired, &self.attached);
        let mut report = AttachReport::default();

        for name in plan.attach {
            let Some(index) = self.links.index_of(&name) else {
                warn!(interface = %name, "interface vanished before attach");
                report.vanished += 1;
                continue;
            };
            match self.attacher.attach(&name) {
                Ok(handle) => {
                    info!(interface = %name, index, "attached ingress hook");
                    self.attached.insert(name, handle);
                    report.attached += 1;
                }
                Err(e) => {
                    warn!(%e, interface = %name, index, "failed to attach ingress hook");
                    report.failed += 1;
                }
            }
        }

        for name in plan.detach {
            self.release(&name, &mut report);
        }
        report
    }

    fn release(&mut self, name: &str, report: &mut AttachReport) {
        let Some(handle) = self.attached.remove(name) else {
            return;
        };
        if self.links.index_of(name).is_none() {
            // the kernel drops the filter together with the interface
            if let Err(e) = self.attacher.detach(handle) {
                debug!(%e, interface = %name, "detach after interface removal");
            }
            info!(interface = %name, "interface gone, dropped ingress hook");
            report.vanished += 1;
            return;
        }
        match self.attacher.detach(handle) {
            Ok(()) => {
                info!(interface = %name, "detached ingress hook");
                report.detached += 1;
            }
            Err(e) => {
                warn!(%e, interface = %name, "failed to detach ingress hook");
                report.failed += 1;
            }
        }
    }

    /// Detaches every hook. Returns the number of failures.
    pub fn release_all(&mut self) -> usize {
        let mut report = AttachReport::default();
        let names: Vec<String> = self.attached.keys().cloned().collect();
        for name in names {
            self.release(&name, &mut report);
        }
        report.failed
    }
}

#[cfg(test)]
pub(crate) mod test {
    use std::collections::HashSet;

    use super::*;
    use crate::links::{Link, LinkKind};

    #[derive(Default)]
    pub(crate) struct RecordingAttacher {
        next: u32,
        pub(crate) attached: Vec<String>,
        pub(crate) detached: Vec<u32>,
        refuse: HashSet<String>,
        fail_detach: bool,
    }

    impl HookAttacher for RecordingAttacher {
        type Handle = u32;

        fn attach(&mut self, interface: &str) -> Result<u32> {
            if self.refuse.contains(interface) {
                return Err(Error::EbpfProgramError(format!(
                    "attach to {interface} refused"
                )));
            }
            self.next += 1;
            self.attached.push(interface.to_string());
            Ok(self.next)
        }

        fn detach(&mut self, handle: u32) -> Result<()> {
            if self.fail_detach {
                return Err(Error::EbpfProgramError(format!("no filter for handle {handle}")));
            }
            self.detached.push(handle);
            Ok(())
        }
    }

    pub(crate) struct StaticLinks(pub(crate) Vec<&'static str>);

    impl HostLinks for StaticLinks {
        fn list(&self) -> Result<Vec<Link>> {
            Ok(self
                .0
                .iter()
                .enumerate()
                .map(|(i, name)| Link {
                    name: name.to_string(),
                    index: i as u32 + 1,
                    kind: LinkKind::Veth,
                })
                .collect())
        }

        fn index_of(&self, name: &str) -> Option<u32> {
            self.0.iter().position(|n| *n == name).map(|i| i as u32 + 1)
        }
    }

    fn names(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    fn attachments(links: &[&'static str]) -> Attachments<RecordingAttacher, StaticLinks> {
        Attachments::new(RecordingAttacher::default(), StaticLinks(links.to_vec()))
    }

    #[test]
    fn test_attaches_missing_and_keeps_existing() {
        let mut attachments = attachments(&["veth1", "veth2"]);
        attachments.reconcile(&names(&["veth1"]));

        let report = attachments.reconcile(&names(&["veth1", "veth2"]));
        assert_eq!(report.attached, 1);
        assert_eq!(report.detached, 0);
        assert_eq!(attachments.attached().collect::<Vec<_>>(), vec!["veth1", "veth2"]);
        assert_eq!(attachments.attacher.attached, vec!["veth1", "veth2"]);
    }

    #[test]
    fn test_detaches_everything_when_nothing_is_desired() {
        let mut attachments = attachments(&["veth1"]);
        attachments.reconcile(&names(&["veth1"]));

        let report = attachments.reconcile(&BTreeSet::new());
        assert_eq!(report.detached, 1);
        assert!(attachments.is_empty());
        assert_eq!(attachments.attacher.detached, vec![1]);
    }

    #[test]
    fn test_second_pass_is_a_noop() {
        let mut attachments = attachments(&["veth1", "veth2"]);
        let desired = names(&["veth1", "veth2"]);
        attachments.reconcile(&desired);

        let report = attachments.reconcile(&desired);
        assert_eq!(report, AttachReport::default());
        assert_eq!(attachments.attacher.attached.len(), 2);
    }

    #[test]
    fn test_vanished_interface_is_skipped() {
        let mut attachments = attachments(&["veth1"]);
        let report = attachments.reconcile(&names(&["veth1", "veth9"]));
        assert_eq!(report.attached, 1);
        assert_eq!(report.vanished, 1);
        assert_eq!(attachments.attached().collect::<Vec<_>>(), vec!["veth1"]);
    }

    #[test]
    fn test_hook_of_removed_interface_is_dropped_without_failure() {
        let mut attachments = attachments(&["veth1", "veth2"]);
        attachments.reconcile(&names(&["veth1", "veth2"]));

        attachments.links.0.retain(|n| *n != "veth1");
        attachments.attacher.fail_detach = true;
        let report = attachments.reconcile(&names(&["veth2"]));
        assert_eq!(
            report,
            AttachReport {
                vanished: 1,
                ..Default::default()
            }
        );
        assert_eq!(attachments.attached().collect::<Vec<_>>(), vec!["veth2"]);
    }

    #[test]
    fn test_detach_failure_on_present_interface_is_counted() {
        let mut attachments = attachments(&["veth1"]);
        attachments.reconcile(&names(&["veth1"]));

        attachments.attacher.fail_detach = true;
        let report = attachments.reconcile(&BTreeSet::new());
        assert_eq!((report.detached, report.failed), (0, 1));
        assert!(attachments.is_empty());
    }

    #[test]
    fn test_attach_failure_is_isolated_and_retried() {
        let mut attachments = attachments(&["veth1", "veth2"]);
        attachments.attacher.refuse.insert("veth1".into());
        let desired = names(&["veth1", "veth2"]);

        let report = attachments.reconcile(&desired);
        assert_eq!((report.attached, report.failed), (1, 1));

        attachments.attacher.refuse.clear();
        let report = attachments.reconcile(&desired);
        assert_eq!(report.attached, 1);
        assert_eq!(attachments.len(), 2);
    }

    #[test]
    fn test_plan_order_does_not_matter() {
        let attached: BTreeMap<String, u32> =
            [("veth1".to_string(), 1), ("veth3".to_string(), 3)].into();
        let desired = names(&["veth1", "veth2"]);
        let plan = plan_attachments(&desired, &attached);
        assert_eq!(plan.attach, vec!["veth2"]);
        assert_eq!(plan.detach, vec!["veth3"]);

        // applying detach before attach lands on the same set
        let mut after: BTreeSet<String> = attached.keys().cloned().collect();
        for name in &plan.detach {
            after.remove(name);
        }
        after.extend(plan.attach.iter().cloned());
        assert_eq!(after, desired);
    }

    #[test]
    fn test_release_all_detaches_every_hook() {
        let mut attachments = attachments(&["veth1", "veth2"]);
        attachments.reconcile(&names(&["veth1", "veth2"]));
        assert_eq!(attachments.release_all(), 0);
        assert!(attachments.is_empty());
        assert_eq!(attachments.attacher.detached.len(), 2);
    }
}
