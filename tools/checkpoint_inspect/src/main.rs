use anyhow::{anyhow, Context, Result};
use std::env;
use std::path::PathBuf;
use tallyline::event_model::checkpoint::{checksum, CheckpointStore, FileCheckpointStore};
use tallyline::sink::{read_records, DocumentStore, FileDocumentStore, DEFAULT_DOCUMENT_ID};

const USAGE: &str = "usage: tallyline-inspect checkpoint <path>\n       \
                     tallyline-inspect log <path>\n       \
                     tallyline-inspect store <root> <database> <collection> [document-id]";

fn main() -> Result<()> {
    let mut args = env::args().skip(1);
    let command = args.next().ok_or_else(|| anyhow!(USAGE))?;
    match command.as_str() {
        "checkpoint" => inspect_checkpoint(next_path(&mut args)?),
        "log" => inspect_log(next_path(&mut args)?),
        "store" => {
            let root = next_path(&mut args)?;
            let database = args.next().ok_or_else(|| anyhow!(USAGE))?;
            let collection = args.next().ok_or_else(|| anyhow!(USAGE))?;
            let id = args.next().unwrap_or_else(|| DEFAULT_DOCUMENT_ID.to_string());
            inspect_store(root, &database, &collection, &id)
        }
        "--help" | "-h" => {
            eprintln!("{USAGE}");
            Ok(())
        }
        other => Err(anyhow!("unknown command: {other}\n{USAGE}")),
    }
}

fn next_path(args: &mut impl Iterator<Item = String>) -> Result<PathBuf> {
    args.next()
        .map(PathBuf::from)
        .ok_or_else(|| anyhow!(USAGE))
}

fn inspect_checkpoint(path: PathBuf) -> Result<()> {
    let store = FileCheckpointStore::new(&path);
    let checkpoint = store
        .load()
        .with_context(|| format!("checkpoint {} failed verification", path.display()))?;
    let Some(checkpoint) = checkpoint else {
        println!("no checkpoint at {}", path.display());
        return Ok(());
    };
    println!("offset        {}", checkpoint.offset);
    println!("sum           {}", checkpoint.sum);
    println!("event_count   {}", checkpoint.event_count);
    println!("committed_at  {} ms", checkpoint.committed_at_ms);
    println!("checksum      {}", checksum(&checkpoint)?);
    Ok(())
}

fn inspect_log(path: PathBuf) -> Result<()> {
    let records = read_records(&path).with_context(|| format!("unable to read {}", path.display()))?;
    let (Some(first), Some(last)) = (records.first(), records.last()) else {
        println!("{} is empty", path.display());
        return Ok(());
    };
    let regressions = records
        .windows(2)
        .filter(|pair| pair[1].offset <= pair[0].offset)
        .count();
    println!("records       {}", records.len());
    println!("first offset  {}", first.offset);
    println!("last offset   {}", last.offset);
    println!("last sum      {}", last.sum);
    if regressions > 0 {
        return Err(anyhow!(
            "{} has {regressions} record(s) whose offset does not advance",
            path.display()
        ));
    }
    Ok(())
}

fn inspect_store(root: PathBuf, database: &str, collection: &str, id: &str) -> Result<()> {
    let store = FileDocumentStore::new(&root, database, collection);
    match store.find(id)? {
        Some(document) => println!("{}", serde_json::to_string_pretty(&document)?),
        None => println!("no document {id} in {}", store.describe()),
    }
    Ok(())
}
