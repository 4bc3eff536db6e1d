//! Library editing commands.

use crate::error::CliResult;
use crate::workspace::Workspace;
use serde_json::{json, Value};
use shelfsync_model::{EntityKind, Fields};

/// Adds a book and prints its ID.
pub fn add(
    ws: &Workspace,
    title: String,
    author: Option<String>,
    isbn: Option<String>,
) -> CliResult<()> {
    let mut fields = Fields::new();
    fields.insert("title".into(), json!(title));
    if let Some(author) = author {
        fields.insert("author".into(), json!(author));
    }
    if let Some(isbn) = isbn {
        fields.insert("isbn".into(), json!(isbn));
    }

    let book = ws.store.create(EntityKind::Book, fields)?;
    println!("{}", book.id);
    Ok(())
}

/// Sets or removes one field.
pub fn set(ws: &Workspace, id: &str, field: String, value: &str) -> CliResult<()> {
    let mut changes = Fields::new();
    changes.insert(field, parse_value(value));
    ws.store.update_fields(EntityKind::Book, id, changes)?;
    Ok(())
}

/// Deletes a book.
pub fn remove(ws: &Workspace, id: &str) -> CliResult<()> {
    ws.store.delete(EntityKind::Book, id)?;
    Ok(())
}

/// Prints live books.
pub fn list(ws: &Workspace) {
    let books = ws.store.list(EntityKind::Book);
    if books.is_empty() {
        println!("No books");
        return;
    }
    for book in books {
        let author = book.field_str("author").unwrap_or("-");
        let linked = if book.is_linked() { "" } else { "  (not synced)" };
        println!("{}  {} / {}{}", book.id, book.label(), author, linked);
    }
}

fn parse_value(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}
