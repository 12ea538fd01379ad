use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};
use rustobjstore::prelude::advanced::{FileRecordStore, FieldValue, ObjectRecord, Record, RecordStore};
use rustobjstore::storage::{JournalManager, TypeIndex};
use rustobjstore::{DurabilityMode, Identity, Query};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "record-tool")]
#[command(about = "Inspection tooling for rustobjstore file record stores")]
struct Cli {
    /// Root directory of the record store
    #[arg(long, short)]
    root: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Type tags that hold records
    Types,
    /// Number of records of one type
    Count { type_tag: String },
    /// Identities of one type in insertion order
    List {
        type_tag: String,
        /// SQL LIKE filter as FIELD=PATTERN
        #[arg(long)]
        like: Option<String>,
    },
    /// Print one record
    Show { identity: String },
    /// Registered service identities
    Services,
    /// Replay a commit journal left by an interrupted process
    Recover,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    if !cli.root.is_dir() {
        return Err(anyhow!("{} is not a record store directory", cli.root.display()));
    }

    if let Command::Recover = cli.command {
        // Opening the store would replay the journal silently.
        return recover(&cli.root);
    }
    let store = FileRecordStore::open(&cli.root, DurabilityMode::Sync)
        .with_context(|| format!("failed to open store at {}", cli.root.display()))?;
    run(&store, cli.command)
}

fn recover(root: &Path) -> Result<()> {
    let journal = JournalManager::new(root, DurabilityMode::Sync);
    let replayed = journal.recover().context("journal replay failed")?;
    if replayed == 0 {
        println!("no interrupted commit found");
    } else {
        println!("replayed {} file(s)", replayed);
    }
    Ok(())
}

fn run(store: &FileRecordStore, command: Command) -> Result<()> {
    match command {
        Command::Types => {
            for type_tag in store.type_tags()? {
                let TypeIndex { next_id, order } = store.read_index(&type_tag)?;
                println!("{:<24} {:>8} records  next id {}", type_tag, order.len(), next_id);
            }
        }
        Command::Count { type_tag } => println!("{}", store.count(&type_tag)?),
        Command::List { type_tag, like } => {
            let query = match like {
                Some(filter) => {
                    let (field, pattern) = filter
                        .split_once('=')
                        .ok_or_else(|| anyhow!("--like expects FIELD=PATTERN"))?;
                    Query::like(field, pattern)
                }
                None => Query::All,
            };
            for found in store.scan(&type_tag, &query)? {
                let found = found?;
                let sequence = found
                    .record
                    .version
                    .as_ref()
                    .map(|v| v.sequence.to_string())
                    .unwrap_or_else(|| "-".to_string());
                println!("{}  v{}", found.identity, sequence);
            }
        }
        Command::Show { identity } => {
            let identity = Identity::parse(&identity)?;
            match store.load(&identity)? {
                Some(Record::Object(record)) => print_record(&record),
                Some(Record::Collection(collection)) => {
                    for element in collection.element_identities {
                        println!("{}", element);
                    }
                }
                None => return Err(anyhow!("no record for {}", identity)),
            }
        }
        Command::Services => {
            for (name, identity) in store.services()? {
                println!("{:<24} {}", name, identity);
            }
        }
        Command::Recover => recover(store.root())?,
    }
    Ok(())
}

fn print_record(record: &ObjectRecord) {
    println!("type: {}", record.type_tag);
    if let Some(version) = &record.version {
        println!(
            "version: {} ({} at {})",
            version.sequence, version.changed_by, version.changed_at
        );
    }
    print_fields(&record.fields, 0);
}

fn print_fields(fields: &BTreeMap<String, FieldValue>, depth: usize) {
    let indent = "  ".repeat(depth);
    for (id, value) in fields {
        match value {
            FieldValue::Scalar(encoded) => println!("{}{} = {}", indent, id, encoded),
            FieldValue::Reference(target) => println!("{}{} -> {}", indent, id, target),
            FieldValue::References(targets) => {
                let list: Vec<String> = targets.iter().map(ToString::to_string).collect();
                println!("{}{} -> [{}]", indent, id, list.join(", "));
            }
            FieldValue::Embedded(embedded) => {
                println!("{}{}: {}", indent, id, embedded.type_tag);
                print_fields(&embedded.fields, depth + 1);
            }
        }
    }
}
