//! Command-line utility for inspecting and repairing a mailq spool
//!
//! Works directly on a file-backed queue directory:
//! - list items, optionally by status
//! - view a single item
//! - requeue a dead-lettered item
//! - enqueue a new message reference
//!
//! A running `mailq` rescans the directory on every poll, so items enqueued
//! or requeued here are picked up without a restart. Listings are a snapshot
//! of the records on disk.

use std::{path::PathBuf, str::FromStr};

use clap::{Parser, Subcommand, ValueEnum};
use mailq_store::{FileQueueStore, ItemStatus, NewQueueItem, QueueItem, QueueItemId, QueueStore};

/// Inspect and repair a mailq spool directory
#[derive(Parser, Debug)]
#[command(name = "mailqctl")]
#[command(about = "Manage a mailq queue directory", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to the queue directory
    #[arg(short, long, default_value = "/tmp/spool/mailq")]
    spool_path: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List items in the queue, oldest first
    List {
        /// Filter by status
        #[arg(long, value_enum)]
        status: Option<StatusFilter>,
    },
    /// View detailed information about a single item
    View {
        /// Queue item ID
        id: String,
    },
    /// Move a dead-lettered item back to pending
    Requeue {
        /// Queue item ID
        id: String,
    },
    /// Add a message reference to the queue
    Enqueue {
        /// Opaque reference handed to the transport
        payload_ref: String,

        /// Failed attempts allowed before dead-lettering
        #[arg(long, default_value_t = 5)]
        max_retries: u32,
    },
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum StatusFilter {
    Pending,
    Claimed,
    Sending,
    Sent,
    Deferred,
    DeadLetter,
}

impl From<StatusFilter> for ItemStatus {
    fn from(filter: StatusFilter) -> Self {
        match filter {
            StatusFilter::Pending => Self::Pending,
            StatusFilter::Claimed => Self::Claimed,
            StatusFilter::Sending => Self::Sending,
            StatusFilter::Sent => Self::Sent,
            StatusFilter::Deferred => Self::Deferred,
            StatusFilter::DeadLetter => Self::DeadLetter,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let store = FileQueueStore::open(cli.spool_path)?;

    match cli.command {
        Commands::List { status } => cmd_list(&store, status.map(ItemStatus::from)).await,
        Commands::View { id } => cmd_view(&store, &parse_id(&id)?).await,
        Commands::Requeue { id } => cmd_requeue(&store, &parse_id(&id)?).await,
        Commands::Enqueue {
            payload_ref,
            max_retries,
        } => cmd_enqueue(&store, payload_ref, max_retries).await,
    }
}

fn parse_id(id: &str) -> anyhow::Result<QueueItemId> {
    QueueItemId::from_str(id).map_err(|e| anyhow::anyhow!("Invalid queue item ID {id}: {e}"))
}

async fn cmd_list(store: &FileQueueStore, status: Option<ItemStatus>) -> anyhow::Result<()> {
    let items = store.list(status).await?;

    if items.is_empty() {
        println!("Queue is empty");
        return Ok(());
    }

    println!(
        "{:<26}  {:<11}  {:>8}  {:<25}  PAYLOAD",
        "ID", "STATUS", "ATTEMPTS", "NEXT ATTEMPT"
    );
    for item in &items {
        println!(
            "{:<26}  {:<11}  {:>8}  {:<25}  {}",
            item.id.to_string(),
            item.reported_status().as_str(),
            format!("{}/{}", item.attempt_count, item.max_retries.saturating_add(1)),
            item.next_attempt_at.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
            item.payload_ref
        );
    }
    println!("\n{} item(s)", items.len());

    Ok(())
}

fn print_item(item: &QueueItem) {
    println!("ID:           {}", item.id);
    println!("Payload:      {}", item.payload_ref);
    println!("Status:       {}", item.reported_status().as_str());
    println!("Attempts:     {} (max retries {})", item.attempt_count, item.max_retries);
    println!("Created:      {}", item.created_at.to_rfc3339());
    println!("Next attempt: {}", item.next_attempt_at.to_rfc3339());

    if let Some(lease) = item.lease() {
        println!(
            "Leased by:    {} since {}",
            lease.owner,
            lease.claimed_at.to_rfc3339()
        );
    }

    if let Some(error) = &item.last_error {
        println!("Last error:   {error}");
    }
}

async fn cmd_view(store: &FileQueueStore, id: &QueueItemId) -> anyhow::Result<()> {
    let Some(item) = store.get(id).await? else {
        anyhow::bail!("No queue item with ID {id}");
    };

    print_item(&item);
    Ok(())
}

async fn cmd_requeue(store: &FileQueueStore, id: &QueueItemId) -> anyhow::Result<()> {
    store.requeue(id).await?;
    println!("Requeued {id}");
    Ok(())
}

async fn cmd_enqueue(
    store: &FileQueueStore,
    payload_ref: String,
    max_retries: u32,
) -> anyhow::Result<()> {
    let item = store.enqueue(NewQueueItem::new(payload_ref, max_retries)).await?;
    print_item(&item);
    Ok(())
}
