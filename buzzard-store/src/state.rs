use crate::event::{Action, Interfaces};

/// Compacted view of one container: the action and interfaces of the newest
/// event seen for it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ContainerState {
    pub container_id: String,
    pub action: Action,
    pub interfaces: Interfaces,
}

impl ContainerState {
    pub fn new(container_id: impl Into<String>, action: Action, interfaces: Interfaces) -> Self {
        Self {
            container_id: container_id.into(),
            action,
            interfaces,
        }
    }
}
