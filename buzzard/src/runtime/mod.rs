//! Collaborators backed by the container runtime: the lifecycle event
//! subscription and per-container process lookup.

pub mod docker;

use std::future::Future;

use buzzard_store::{Action, Interfaces, LifecycleEvent};

use crate::Result;

pub const CONTAINER_EVENT_TYPE: &str = "container";

/// A lifecycle event as reported by the runtime, before host interfaces are observed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RuntimeEvent {
    pub category: String,
    pub action: String,
    pub container_id: String,
    pub container_name: String,
    pub image: String,
    pub time: i64,
    pub time_nano: i64,
}

impl RuntimeEvent {
    pub fn is_container(&self) -> bool {
        self.category == CONTAINER_EVENT_TYPE && !self.container_id.is_empty()
    }

    pub fn into_lifecycle_event(self, interfaces: Interfaces) -> LifecycleEvent {
        LifecycleEvent {
            action: Action::from(self.action.as_str()),
            container_id: self.container_id,
            container_name: self.container_name,
            image: self.image,
            category: self.category,
            time: self.time,
            time_nano: self.time_nano,
            interfaces,
        }
    }
}

/// Long lived subscription to runtime events.
pub trait EventSource {
    /// Waits for the next event. Any error ends the subscription.
    fn next_event(&mut self) -> impl Future<Output = Result<RuntimeEvent>> + Send;
}

pub trait ProcessInspector {
    /// Pid of the container's init process, `None` when it is not running or unknown.
    fn pid_for(&self, container_id: &str) -> impl Future<Output = Result<Option<u32>>> + Send;
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_into_lifecycle_event() {
        let event = RuntimeEvent {
            category: "container".into(),
            action: "destroy".into(),
            container_id: "abc".into(),
            container_name: "web".into(),
            image: "nginx".into(),
            time: 1,
            time_nano: 1_000_000_001,
        };
        assert!(event.is_container());
        let lifecycle = event.into_lifecycle_event(Interfaces::from_delimited("veth0"));
        assert_eq!(lifecycle.action, Action::Destroy);
        assert_eq!(lifecycle.time_nano, 1_000_000_001);
        assert!(lifecycle.interfaces.contains("veth0"));
    }

    #[test]
    fn test_non_container_events_are_ignored() {
        let event = RuntimeEvent {
            category: "network".into(),
            action: "connect".into(),
            container_id: "n1".into(),
            container_name: String::new(),
            image: String::new(),
            time: 0,
            time_nano: 0,
        };
        assert!(!event.is_container());
    }
}
