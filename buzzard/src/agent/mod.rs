mod ingest;
pub mod metrics;
mod reconcile;

use std::path::Path;

use buzzard_ebpf_common::policy::POLICY_MAP_NAME;
use buzzard_store::Store;
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::bpf::policy::PolicySync;
use crate::bpf::tc::{Attachments, TcIngress};
use crate::config::AgentArgs;
use crate::links::SysfsLinks;
use crate::resolver::CgroupResolver;
use crate::runtime::docker::DockerClient;
use crate::{Error, Result, bpf};

use self::metrics::{PassMetrics, StateMetrics};

/// Opens every collaborator, runs the ingestion and reconciliation tasks and
/// returns once `cancel` fires or the event subscription breaks.
///
/// Kernel state this process created is released before returning.
pub async fn start(
    args: AgentArgs,
    ready: CancellationToken,
    cancel: CancellationToken,
) -> Result<()> {
    if let Err(e) = bpf::remove_memlock() {
        warn!(%e, "failed to remove memlock rlimit");
    }

    info!(path = %args.database.display(), "opening coordination store");
    let open = || Store::open(&args.database, args.busy_timeout());
    let ingest_store = open()?;
    let compact_store = open()?;
    let sync_store = open()?;
    let attach_store = open()?;

    info!(pin = %args.policy_map_pin.display(), "opening policy table");
    let policy_map = bpf::load_policy_map(&args.policy_map_pin)?;

    info!(
        object = %args.tc_object.display(),
        program = %args.tc_program,
        "loading tc classifier"
    );
    if args.policy_map_pin.file_name().and_then(|n| n.to_str()) != Some(POLICY_MAP_NAME) {
        warn!(
            pin = %args.policy_map_pin.display(),
            expected = POLICY_MAP_NAME,
            "policy table pin name differs from the map the classifier declares"
        );
    }
    let pin_dir = args.policy_map_pin.parent().unwrap_or(Path::new("/"));
    let classifier = TcIngress::load(&args.tc_object, &args.tc_program, pin_dir)?;

    info!(socket = %args.docker_socket.display(), "subscribing to container events");
    let docker = DockerClient::new(&args.docker_socket);
    let events = docker.subscribe().await?;

    let links = SysfsLinks::new(&args.sys_class_net, &args.interface_prefix);
    let state_metrics = StateMetrics::new();
    ready.cancel();

    let tasks = cancel.child_token();
    let mut ingest = tokio::spawn(ingest::run(
        events,
        ingest_store,
        links.clone(),
        state_metrics.clone(),
        tasks.clone(),
    ));
    let compact = tokio::spawn(reconcile::compact(
        compact_store,
        links.clone(),
        args.compact_interval(),
        PassMetrics::new("compact"),
        tasks.clone(),
    ));
    let map_sync = tokio::spawn(reconcile::map_sync(
        sync_store,
        PolicySync::new(policy_map),
        CgroupResolver::new(docker, &args.proc_root),
        args.map_sync_interval(),
        PassMetrics::new("map_sync"),
        state_metrics.clone(),
        tasks.clone(),
    ));
    let attach = tokio::spawn(reconcile::attach(
        attach_store,
        Attachments::new(classifier, links),
        args.attach_interval(),
        PassMetrics::new("attach"),
        state_metrics,
        tasks.clone(),
    ));

    let ingested = tokio::select! {
        res = &mut ingest => Some(res),
        _ = cancel.cancelled() => None,
    };
    tasks.cancel();
    let ingested = match ingested {
        Some(res) => res,
        None => ingest.await,
    };
    let (compact, map_sync, attach) = tokio::join!(compact, map_sync, attach);
    for (task, res) in [("compact", compact), ("map_sync", map_sync), ("attach", attach)] {
        if let Err(e) = joined(res) {
            error!(%e, task, "task exited with error");
        }
    }
    joined(ingested)
}

fn joined(res: Result<Result<()>, JoinError>) -> Result<()> {
    res.map_err(|e| Error::Task(e.to_string()))?
}
