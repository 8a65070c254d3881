use buzzard_store::{Interfaces, LifecycleEvent, Store, short_id};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::agent::metrics::StateMetrics;
use crate::links::SysfsLinks;
use crate::runtime::{EventSource, RuntimeEvent};
use crate::{Error, Result};

/// Records every container event the source delivers until cancelled.
///
/// Returns an error only when the source breaks; a lost subscription would
/// leave every downstream pass working on stale state.
pub(crate) async fn run<E>(
    mut source: E,
    store: Store,
    links: SysfsLinks,
    metrics: StateMetrics,
    cancel: CancellationToken,
) -> Result<()>
where
    E: EventSource + Send,
{
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            event = source.next_event() => event?,
        };
        if !event.is_container() {
            debug!(category = %event.category, action = %event.action, "ignoring event");
            continue;
        }

        let action = event.action.clone();
        let store = store.clone();
        let links = links.clone();
        let recorded = tokio::task::spawn_blocking(move || record(&store, &links, event))
            .await
            .map_err(|e| Error::Task(e.to_string()))
            .and_then(|res| res);
        match recorded {
            Ok(event) => {
                info!(
                    container = short_id(&event.container_id),
                    name = %event.container_name,
                    action = %event.action,
                    interfaces = %event.interfaces,
                    "recorded lifecycle event"
                );
                metrics.count_event(&action, "recorded");
            }
            Err(e) => {
                warn!(%e, action = %action, "dropping lifecycle event");
                metrics.count_event(&action, "dropped");
            }
        }
    }
}

fn record(store: &Store, links: &SysfsLinks, event: RuntimeEvent) -> Result<LifecycleEvent> {
    let interfaces = links.container_interfaces().unwrap_or_else(|e| {
        warn!(%e, "failed to list host interfaces");
        Interfaces::default()
    });
    let event = event.into_lifecycle_event(interfaces);
    store.record(&event)?;
    Ok(event)
}
