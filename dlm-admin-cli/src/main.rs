// Licensed under the MIT License.

use std::collections::BTreeSet;
use std::sync::Mutex;

use clap::{Parser, Subcommand};
use env_logger::Builder;

const TOOL_VERSION: &str = "0.0.1";
const TOOL_ABOUT_SHORT: &str = "Distributed Lock Manager administrative CLI";
const TOOL_ABOUT_LONG: &str =
    "Creates, lists, and deletes the backing tables a distributed lock manager session binds to.";

/// Outcome of a `create-table` call. Creating a table that already exists is
/// not an error: the operation is idempotent, per the tool's exit-code
/// contract.
enum CreateTableOutcome {
    Created,
    AlreadyExists,
}

/// Outcome of a `delete-table` call. Deleting a table that is already gone
/// is not an error, for the same reason.
enum DeleteTableOutcome {
    Deleted,
    DidNotExist,
}

/// Administrative lifecycle for backing tables, kept deliberately separate
/// from the lock protocol: `dlm-core` never depends on this trait, so a real
/// deployment can swap in a vendor-SDK-backed implementation here without
/// touching the library.
///
/// `Err` is reserved for genuine failures (e.g. the backing service being
/// unreachable); "already exists" and "does not exist" are reported as
/// `Ok` outcomes.
trait TableAdmin {
    fn create_table(&self, name: &str) -> Result<CreateTableOutcome, String>;
    fn delete_table(&self, name: &str) -> Result<DeleteTableOutcome, String>;
    fn list_tables(&self) -> Vec<String>;
}

/// Process-local `TableAdmin` for local and development use. A real
/// deployment substitutes a vendor-SDK-backed implementation of the same
/// trait without changing this CLI.
#[derive(Default)]
struct InMemoryTableAdmin {
    tables: Mutex<BTreeSet<String>>,
}

impl TableAdmin for InMemoryTableAdmin {
    fn create_table(&self, name: &str) -> Result<CreateTableOutcome, String> {
        let mut tables = self.tables.lock().expect("table registry mutex poisoned");
        if tables.insert(name.to_string()) {
            Ok(CreateTableOutcome::Created)
        } else {
            Ok(CreateTableOutcome::AlreadyExists)
        }
    }

    fn delete_table(&self, name: &str) -> Result<DeleteTableOutcome, String> {
        let mut tables = self.tables.lock().expect("table registry mutex poisoned");
        if tables.remove(name) {
            Ok(DeleteTableOutcome::Deleted)
        } else {
            Ok(DeleteTableOutcome::DidNotExist)
        }
    }

    fn list_tables(&self) -> Vec<String> {
        self.tables
            .lock()
            .expect("table registry mutex poisoned")
            .iter()
            .cloned()
            .collect()
    }
}

#[derive(Parser)]
#[command(version = TOOL_VERSION, about = TOOL_ABOUT_SHORT, long_about = TOOL_ABOUT_LONG)]
struct Cli {
    #[command(subcommand)]
    cmd: Commands,
    /// Verbose logging (debug and above).
    #[arg(short = None, long, default_value_t = false, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Creates a new, empty backing table.
    CreateTable {
        /// Table name to create.
        name: String,
    },
    /// Deletes a backing table. Fails if the table still holds live lock records.
    DeleteTable {
        /// Table name to delete.
        name: String,
    },
    /// Lists known backing tables.
    ListTables,
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let args = Cli::parse();

    let logging_level = if args.verbose {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };
    Builder::new()
        .filter_level(logging_level)
        .format_timestamp(None)
        .init();

    // A single process-local registry stands in for a vendor-SDK-backed
    // admin client; this tool never touches lock records, only table
    // lifecycle, so there is nothing here for dlm-core to depend on.
    let admin = InMemoryTableAdmin::default();

    let exit_code = match args.cmd {
        Commands::CreateTable { name } => match admin.create_table(&name) {
            Ok(CreateTableOutcome::Created) => {
                log::info!("created table {name:?}");
                0
            }
            Ok(CreateTableOutcome::AlreadyExists) => {
                println!("table {name:?} already exists");
                0
            }
            Err(message) => {
                eprintln!("{message}");
                1
            }
        },
        Commands::DeleteTable { name } => match admin.delete_table(&name) {
            Ok(DeleteTableOutcome::Deleted) => {
                log::info!("deleted table {name:?}");
                0
            }
            Ok(DeleteTableOutcome::DidNotExist) => {
                println!("table {name:?} does not exist");
                0
            }
            Err(message) => {
                eprintln!("{message}");
                1
            }
        },
        Commands::ListTables => {
            for table in admin.list_tables() {
                println!("{table}");
            }
            0
        }
    };

    std::process::exit(exit_code);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_then_list_then_delete_round_trips() {
        let admin = InMemoryTableAdmin::default();
        assert!(matches!(
            admin.create_table("locks").unwrap(),
            CreateTableOutcome::Created
        ));
        assert_eq!(admin.list_tables(), vec!["locks".to_string()]);
        assert!(matches!(
            admin.delete_table("locks").unwrap(),
            DeleteTableOutcome::Deleted
        ));
        assert!(admin.list_tables().is_empty());
    }

    #[test]
    fn create_table_twice_is_idempotent() {
        let admin = InMemoryTableAdmin::default();
        admin.create_table("locks").unwrap();
        assert!(matches!(
            admin.create_table("locks").unwrap(),
            CreateTableOutcome::AlreadyExists
        ));
    }

    #[test]
    fn delete_unknown_table_reports_does_not_exist() {
        let admin = InMemoryTableAdmin::default();
        assert!(matches!(
            admin.delete_table("missing").unwrap(),
            DeleteTableOutcome::DidNotExist
        ));
    }
}
