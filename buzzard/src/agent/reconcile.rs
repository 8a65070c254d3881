//! Periodic passes: compaction, policy table sync and hook attachment.
//!
//! Each pass owns the state it mutates and reads the compacted container
//! rows through its own store connection.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use buzzard_ebpf_common::policy::{PolicyValue, Slot};
use buzzard_store::{ContainerState, Store};
use tokio::time::{Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::agent::metrics::{PassMetrics, StateMetrics};
use crate::bpf::BpfMap;
use crate::bpf::policy::PolicySync;
use crate::bpf::tc::{Attachments, HookAttacher};
use crate::links::{HostLinks, SysfsLinks};
use crate::resolver::CgroupResolver;
use crate::runtime::ProcessInspector;
use crate::{Error, Result};

fn ticker(period: Duration) -> Interval {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

/// Waits for the next tick. Returns false once cancelled.
async fn tick(interval: &mut Interval, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = interval.tick() => true,
    }
}

async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| Error::Task(e.to_string()))?
}

async fn container_states(store: &Store) -> Result<BTreeMap<String, ContainerState>> {
    let store = store.clone();
    blocking(move || Ok(store.container_states()?)).await
}

/// Interface names wanted by any compacted container.
pub(crate) fn desired_interfaces(states: &BTreeMap<String, ContainerState>) -> BTreeSet<String> {
    states
        .values()
        .flat_map(|s| s.interfaces.iter().map(str::to_string))
        .collect()
}

pub(crate) async fn compact(
    store: Store,
    links: SysfsLinks,
    period: Duration,
    metrics: PassMetrics,
    cancel: CancellationToken,
) -> Result<()> {
    let mut interval = ticker(period);
    while tick(&mut interval, &cancel).await {
        let _measurer = metrics.count_and_measure();
        let store = store.clone();
        let links = links.clone();
        let res = blocking(move || {
            let existing = links
                .names()
                .inspect_err(|e| warn!(%e, "failed to list host interfaces, not pruning"))
                .ok();
            Ok(store.compact(existing.as_ref())?)
        })
        .await;
        match res {
            Ok(report) => {
                metrics.count_item_failures(report.failed);
                if !report.is_noop() {
                    info!(
                        upserted = report.upserted.len(),
                        removed = report.removed.len(),
                        failed = report.failed,
                        "compacted container state"
                    );
                }
            }
            Err(e) => {
                warn!(%e, "compaction pass failed");
                metrics.count_failure(&e);
            }
        }
    }
    Ok(())
}

pub(crate) async fn map_sync<M, P>(
    store: Store,
    mut policy: PolicySync<M>,
    resolver: CgroupResolver<P>,
    period: Duration,
    metrics: PassMetrics,
    state_metrics: StateMetrics,
    cancel: CancellationToken,
) -> Result<()>
where
    M: BpfMap<Slot, PolicyValue>,
    P: ProcessInspector,
{
    let mut interval = ticker(period);
    while tick(&mut interval, &cancel).await {
        let _measurer = metrics.count_and_measure();
        let states = match container_states(&store).await {
            Ok(states) => states,
            Err(e) => {
                warn!(%e, "failed to read container state, skipping policy sync");
                metrics.count_failure(&e);
                continue;
            }
        };
        let desired: BTreeSet<String> = states.into_keys().collect();
        let resolved = resolver.resolve_all(&desired).await;
        let report = policy.sync(&desired, &resolved);

        metrics.count_item_failures(report.failed);
        state_metrics.slots.set(policy.slots().len() as i64);
        debug!(
            desired = desired.len(),
            written = report.written,
            deleted = report.deleted,
            unresolved = report.unresolved,
            beyond_capacity = report.beyond_capacity,
            failed = report.failed,
            "synced policy table"
        );
    }

    info!(slots = policy.slots().len(), "releasing policy table entries");
    let failed = policy.release_all();
    state_metrics.slots.set(policy.slots().len() as i64);
    if failed > 0 {
        warn!(failed, "some policy table entries were not released");
    }
    Ok(())
}

pub(crate) async fn attach<H, L>(
    store: Store,
    mut attachments: Attachments<H, L>,
    period: Duration,
    metrics: PassMetrics,
    state_metrics: StateMetrics,
    cancel: CancellationToken,
) -> Result<()>
where
    H: HookAttacher,
    L: HostLinks,
{
    let mut interval = ticker(period);
    while tick(&mut interval, &cancel).await {
        let _measurer = metrics.count_and_measure();
        let states = match container_states(&store).await {
            Ok(states) => states,
            Err(e) => {
                warn!(%e, "failed to read container state, skipping attachment pass");
                metrics.count_failure(&e);
                continue;
            }
        };
        let report = attachments.reconcile(&desired_interfaces(&states));

        metrics.count_item_failures(report.failed);
        state_metrics.attached.set(attachments.len() as i64);
        debug!(
            attached = report.attached,
            detached = report.detached,
            vanished = report.vanished,
            failed = report.failed,
            "reconciled attachments"
        );
    }

    info!(hooks = attachments.len(), "detaching ingress hooks");
    let failed = attachments.release_all();
    state_metrics.attached.set(attachments.len() as i64);
    if failed > 0 {
        warn!(failed, "some ingress hooks were not detached");
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use buzzard_store::{Action, Interfaces, LifecycleEvent};

    use super::*;
    use crate::bpf::tc::test::{RecordingAttacher, StaticLinks};

    fn state(id: &str, ifaces: &str) -> ContainerState {
        ContainerState::new(id, Action::Start, Interfaces::from_delimited(ifaces))
    }

    #[test]
    fn test_desired_interfaces_is_the_union() {
        let states: BTreeMap<_, _> = [
            ("a".to_string(), state("a", "veth0,veth1")),
            ("b".to_string(), state("b", "veth1,veth2")),
            ("c".to_string(), state("c", "")),
        ]
        .into();
        let desired = desired_interfaces(&states);
        assert_eq!(
            desired.into_iter().collect::<Vec<_>>(),
            vec!["veth0", "veth1", "veth2"]
        );
    }

    #[test]
    fn test_destroyed_container_is_released_after_one_pass_each() -> Result<()> {
        let store = Store::in_memory()?;
        let record = |id: &str, action: &str, time_nano: i64| LifecycleEvent {
            container_id: id.into(),
            container_name: String::new(),
            image: String::new(),
            action: Action::from(action),
            category: "container".into(),
            time: 0,
            time_nano,
            interfaces: Interfaces::from_delimited("veth0"),
        };
        store.record(&record("a", "start", 1))?;
        store.compact(None)?;

        let mut policy = PolicySync::new(ahash::HashMap::<Slot, PolicyValue>::default());
        let mut attachments =
            Attachments::new(RecordingAttacher::default(), StaticLinks(vec!["veth0"]));
        let states = store.container_states()?;
        let desired: BTreeSet<String> = states.keys().cloned().collect();
        policy.sync(&desired, &[("a".to_string(), 42)].into());
        assert_eq!(policy.map().get_state()?.len(), 1);
        let report = attachments.reconcile(&desired_interfaces(&states));
        assert_eq!(report.attached, 1);
        assert_eq!(attachments.attached().collect::<Vec<_>>(), vec!["veth0"]);

        store.record(&record("a", "destroy", 2))?;
        store.compact(None)?;
        let states = store.container_states()?;
        assert!(states.is_empty());
        assert!(desired_interfaces(&states).is_empty());

        let desired: BTreeSet<String> = states.keys().cloned().collect();
        policy.sync(&desired, &BTreeMap::new());
        assert!(policy.map().get_state()?.is_empty());
        assert!(policy.slots().is_empty());

        let report = attachments.reconcile(&desired_interfaces(&states));
        assert_eq!((report.detached, report.failed), (1, 0));
        assert!(attachments.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_tick_stops_on_cancel() {
        let cancel = CancellationToken::new();
        let mut interval = ticker(Duration::from_secs(5));
        assert!(tick(&mut interval, &cancel).await);
        cancel.cancel();
        assert!(!tick(&mut interval, &cancel).await);
    }
}
