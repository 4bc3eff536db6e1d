//! Queue listing command.

use crate::error::CliResult;
use crate::workspace::Workspace;
use shelfsync_model::QueueItem;

/// Prints pending queue items, or every item with `all`.
pub fn run(ws: &Workspace, all: bool) -> CliResult<()> {
    let items = if all {
        ws.journal.items()
    } else {
        ws.journal.list_pending()
    };

    if items.is_empty() {
        println!("Queue is empty");
        return Ok(());
    }

    println!(
        "{:>5}  {:<11} {:<34} {:<7} {:<10} {:>7}  CREATED",
        "SEQ", "KIND", "ENTITY", "OP", "STATUS", "RETRIES"
    );
    for item in &items {
        println!("{}", format_item(item));
        if let Some(error) = &item.last_error {
            println!("       last error: {error}");
        }
    }
    Ok(())
}

fn format_item(item: &QueueItem) -> String {
    format!(
        "{:>5}  {:<11} {:<34} {:<7} {:<10} {:>7}  {}",
        item.seq,
        item.entity_type.as_str(),
        item.entity_id,
        item.operation.as_str(),
        item.status.as_str(),
        item.retry_count,
        item.created_at.format("%Y-%m-%d %H:%M:%S"),
    )
}
