use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};

use manifestdb::manifest::decode_block_entries;
use manifestdb::{
    BlockStore, CancelToken, EntryId, LocalBlockStore, ManifestManager, MANIFEST_BLOCK_PREFIX,
};

#[derive(Debug, Parser)]
#[command(name = "manifestdb")]
#[command(about = "Manifest repository inspection tools", long_about = None)]
struct Cli {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Show manifest items: metadata plus the raw JSON payload.
    ManifestShow {
        #[arg(long)]
        repo: PathBuf,
        /// Manifest ids to show.
        #[arg(required = true)]
        ids: Vec<String>,
    },
    /// List manifest blocks and, optionally, the entries inside each.
    BlockIndex {
        #[arg(long)]
        repo: PathBuf,
        #[arg(long, value_enum, default_value = "time")]
        sort: SortOrder,
        /// Decode and print the entries of every block.
        #[arg(long)]
        entries: bool,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum SortOrder {
    Id,
    Time,
    Size,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    match cli.cmd {
        Command::ManifestShow { repo, ids } => manifest_show(&repo, &ids),
        Command::BlockIndex { repo, sort, entries } => block_index(&repo, sort, entries),
    }
}

fn manifest_show(repo: &Path, ids: &[String]) -> anyhow::Result<()> {
    let ctx = CancelToken::new();
    let store = LocalBlockStore::new(repo)
        .with_context(|| format!("open repository {}", repo.display()))?;
    let manager =
        ManifestManager::open(&ctx, Arc::new(store)).context("load manifest blocks")?;

    for raw_id in ids {
        let id = EntryId::from_hex(raw_id)?;
        let metadata = manager
            .get_metadata(&id)
            .with_context(|| format!("get metadata for {raw_id}"))?;
        let content = manager
            .get_raw(&id)
            .with_context(|| format!("show {raw_id}"))?;

        println!("// id: {}", metadata.id);
        println!("// length: {}", metadata.length);
        println!(
            "// modified: {}",
            metadata
                .mod_time
                .with_timezone(&chrono::Local)
                .format("%Y-%m-%d %H:%M:%S %Z")
        );
        for (key, value) in &metadata.labels {
            println!("// label {key}:{value}");
        }
        match serde_json::from_slice::<serde_json::Value>(&content) {
            Ok(value) => println!("{}", serde_json::to_string_pretty(&value)?),
            Err(_) => println!("{}", String::from_utf8_lossy(&content)),
        }
    }

    Ok(())
}

fn block_index(repo: &Path, sort: SortOrder, show_entries: bool) -> anyhow::Result<()> {
    let ctx = CancelToken::new();
    let store = LocalBlockStore::new(repo)
        .with_context(|| format!("open repository {}", repo.display()))?;

    let mut blocks = store.list_blocks(MANIFEST_BLOCK_PREFIX)?;
    match sort {
        SortOrder::Id => blocks.sort_by(|a, b| a.id.cmp(&b.id)),
        SortOrder::Time => blocks.sort_by_key(|info| info.timestamp),
        SortOrder::Size => blocks.sort_by_key(|info| info.length),
    }

    for info in &blocks {
        println!(
            "block:{} created:{} length:{}",
            info.id,
            info.timestamp
                .with_timezone(&chrono::Local)
                .format("%Y-%m-%d %H:%M:%S %Z"),
            info.length
        );
        if !show_entries {
            continue;
        }

        let data = store
            .get_block(&ctx, &info.id)
            .with_context(|| format!("read block {}", info.id))?;
        for entry in decode_block_entries(&info.id, &data)? {
            if entry.deleted {
                println!("  deleted {}", entry.id);
            } else {
                println!(
                    "  added {} length:{} modified:{}",
                    entry.id,
                    entry.content.len(),
                    entry.mod_time.to_rfc3339()
                );
            }
        }
    }

    Ok(())
}
