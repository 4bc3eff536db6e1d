//! Status and journal maintenance commands.

use crate::error::CliResult;
use crate::workspace::Workspace;
use shelfsync_model::{EntityKind, QueueStatus};

/// Prints cursors and queue counts.
pub fn run(ws: &Workspace) -> CliResult<()> {
    let items = ws.journal.items();
    let count = |status: QueueStatus| items.iter().filter(|i| i.status == status).count();

    println!("Data directory: {}", ws.dir.display());
    println!();
    println!("Queue:");
    println!("  Pending:   {}", count(QueueStatus::Pending));
    println!("  Completed: {}", count(QueueStatus::Completed));
    println!("  Abandoned: {}", count(QueueStatus::Abandoned));
    println!();
    println!("Cursors:");
    let cursors = ws.journal.cursors();
    for kind in EntityKind::ALL {
        match cursors.get(&kind) {
            Some(at) => println!("  {:<12} {}", kind.as_str(), at.to_rfc3339()),
            None => println!("  {:<12} never synced", kind.as_str()),
        }
    }
    Ok(())
}

/// Rewrites the journal as a snapshot.
pub fn compact(ws: &Workspace) -> CliResult<()> {
    ws.journal.compact()?;
    println!("Journal compacted");
    Ok(())
}
