use buzzard_store::{ContainerState, Store};
use tabled::{Table, Tabled, settings::Style};

use crate::cli::StateCommands;

pub(crate) fn run(store: &Store, cmd: StateCommands) -> anyhow::Result<()> {
    match cmd {
        StateCommands::List => list(store)?,
    }
    Ok(())
}

#[derive(Debug, Tabled)]
struct StateRow {
    container: String,
    action: String,
    interfaces: String,
}

impl From<ContainerState> for StateRow {
    fn from(state: ContainerState) -> Self {
        Self {
            container: state.container_id,
            action: state.action.to_string(),
            interfaces: state.interfaces.to_delimited(),
        }
    }
}

fn list(store: &Store) -> anyhow::Result<()> {
    let rows: Vec<StateRow> = store
        .container_states()?
        .into_values()
        .map(StateRow::from)
        .collect();

    let table = Table::new(rows).with(Style::empty()).to_string();
    println!("{table}");
    Ok(())
}
