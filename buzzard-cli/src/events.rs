use buzzard_store::{RecordedEvent, Store, short_id};
use tabled::{Table, Tabled, settings::Style};

use crate::cli::EventsCommands;

pub(crate) fn run(store: &Store, cmd: EventsCommands) -> anyhow::Result<()> {
    match cmd {
        EventsCommands::List { container, limit } => list(store, container.as_deref(), limit)?,
    }
    Ok(())
}

#[derive(Debug, Tabled)]
struct EventRow {
    id: i64,
    container: String,
    name: String,
    image: String,
    action: String,
    time_nano: i64,
    interfaces: String,
}

impl From<RecordedEvent> for EventRow {
    fn from(recorded: RecordedEvent) -> Self {
        let event = recorded.event;
        Self {
            id: recorded.id,
            container: short_id(&event.container_id).to_string(),
            name: event.container_name,
            image: event.image,
            action: event.action.to_string(),
            time_nano: event.time_nano,
            interfaces: event.interfaces.to_delimited(),
        }
    }
}

fn list(store: &Store, container: Option<&str>, limit: Option<usize>) -> anyhow::Result<()> {
    let rows: Vec<EventRow> = store
        .events(container, limit)?
        .into_iter()
        .map(EventRow::from)
        .collect();

    let table = Table::new(rows).with(Style::empty()).to_string();
    println!("{table}");
    Ok(())
}
