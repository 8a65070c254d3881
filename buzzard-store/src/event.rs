use std::fmt::Display;

const INTERFACE_DELIMITER: char = ',';
const SHORT_ID_LEN: usize = 12;

/// Lifecycle action reported by the container runtime.
///
/// The runtime vocabulary is open ended (`exec_start: sh`, `health_status: healthy`, ...),
/// anything the agent does not act on is carried verbatim in [`Action::Other`].
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Action {
    Create,
    Start,
    Restart,
    Pause,
    Unpause,
    Kill,
    Die,
    Stop,
    Destroy,
    Other(String),
}

impl Action {
    pub fn as_str(&self) -> &str {
        match self {
            Action::Create => "create",
            Action::Start => "start",
            Action::Restart => "restart",
            Action::Pause => "pause",
            Action::Unpause => "unpause",
            Action::Kill => "kill",
            Action::Die => "die",
            Action::Stop => "stop",
            Action::Destroy => "destroy",
            Action::Other(other) => other,
        }
    }

    /// A destroyed container is no longer of interest to enforcement.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Action::Destroy)
    }
}

impl From<&str> for Action {
    fn from(value: &str) -> Self {
        match value {
            "create" => Action::Create,
            "start" => Action::Start,
            "restart" => Action::Restart,
            "pause" => Action::Pause,
            "unpause" => Action::Unpause,
            "kill" => Action::Kill,
            "die" => Action::Die,
            "stop" => Action::Stop,
            "destroy" => Action::Destroy,
            other => Action::Other(other.to_string()),
        }
    }
}

impl Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ordered set of host interface names observed for a container, stored as a
/// single comma delimited column.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct Interfaces(Vec<String>);

impl Interfaces {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut out: Vec<String> = Vec::new();
        for name in names {
            let name: String = name.into();
            let name = name.trim();
            if name.is_empty() || out.iter().any(|n| n == name) {
                continue;
            }
            out.push(name.to_string());
        }
        Self(out)
    }

    pub fn from_delimited(value: &str) -> Self {
        Self::new(value.split(INTERFACE_DELIMITER))
    }

    pub fn to_delimited(&self) -> String {
        self.0.join(&INTERFACE_DELIMITER.to_string())
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.iter().any(|n| n == name)
    }

    pub fn retain<F>(&mut self, f: F)
    where
        F: FnMut(&String) -> bool,
    {
        self.0.retain(f)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Display for Interfaces {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_delimited())
    }
}

/// One lifecycle event as delivered by the runtime. Never mutated once recorded.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LifecycleEvent {
    pub container_id: String,
    pub container_name: String,
    pub image: String,
    pub action: Action,
    pub category: String,
    /// Coarse timestamp, seconds since the epoch.
    pub time: i64,
    /// Fine timestamp, nanoseconds since the epoch. Orders events of one container.
    pub time_nano: i64,
    pub interfaces: Interfaces,
}

/// A [`LifecycleEvent`] read back from the log together with its row id.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecordedEvent {
    pub id: i64,
    pub event: LifecycleEvent,
}

/// Shortened container id used in log lines, the same 12 characters docker prints.
pub fn short_id(id: &str) -> &str {
    match id.char_indices().nth(SHORT_ID_LEN) {
        Some((idx, _)) => &id[..idx],
        None => id,
    }
}
