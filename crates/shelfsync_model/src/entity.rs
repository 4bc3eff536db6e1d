//! Local entities and remote snapshots.

use crate::error::{ModelError, ModelResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Ordered field map carried by entities and snapshots.
///
/// The engine treats field values as opaque except for the label and the
/// natural-key lookup.
pub type Fields = BTreeMap<String, serde_json::Value>;

/// Kind of synchronizable entity.
///
/// Each kind maps to one remote collection and owns its own sync cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    /// A book in the library.
    Book,
    /// A reading session or event attached to a book.
    ReadingLog,
}

impl EntityKind {
    /// All kinds, in sync order.
    pub const ALL: [EntityKind; 2] = [EntityKind::Book, EntityKind::ReadingLog];

    /// Returns the canonical string form.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Book => "book",
            EntityKind::ReadingLog => "reading_log",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = ModelError;

    fn from_str(s: &str) -> ModelResult<Self> {
        match s {
            "book" => Ok(EntityKind::Book),
            "reading_log" => Ok(EntityKind::ReadingLog),
            other => Err(ModelError::UnknownKind(other.to_string())),
        }
    }
}

/// A synchronizable local record.
///
/// `remote_id` is set iff the entity has been created remotely at least
/// once. `remote_modified_at` is the remote timestamp as of the last
/// successful reconciliation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    /// Entity kind.
    pub kind: EntityKind,
    /// Local identifier, unique within its kind.
    pub id: String,
    /// Payload fields.
    pub fields: Fields,
    /// Updated on every local write.
    pub local_modified_at: DateTime<Utc>,
    /// Remote record ID once linked.
    pub remote_id: Option<String>,
    /// Remote modification time at last reconciliation.
    pub remote_modified_at: Option<DateTime<Utc>>,
    /// Set when the entity is a tombstone awaiting delete propagation.
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Entity {
    /// Creates a new, never-synced entity.
    pub fn new(kind: EntityKind, id: impl Into<String>, fields: Fields, now: DateTime<Utc>) -> Self {
        Self {
            kind,
            id: id.into(),
            fields,
            local_modified_at: now,
            remote_id: None,
            remote_modified_at: None,
            deleted_at: None,
        }
    }

    /// Links the entity to a remote record.
    #[must_use]
    pub fn with_remote(mut self, remote_id: impl Into<String>, remote_modified_at: DateTime<Utc>) -> Self {
        self.remote_id = Some(remote_id.into());
        self.remote_modified_at = Some(remote_modified_at);
        self
    }

    /// Human-readable label: the `title` field, else `kind/id`.
    #[must_use]
    pub fn label(&self) -> String {
        label_of(&self.fields).unwrap_or_else(|| format!("{}/{}", self.kind, self.id))
    }

    /// Returns a string field, if present.
    #[must_use]
    pub fn field_str(&self, name: &str) -> Option<&str> {
        self.fields.get(name).and_then(|v| v.as_str())
    }

    /// Returns true if the entity has been created remotely.
    #[must_use]
    pub fn is_linked(&self) -> bool {
        self.remote_id.is_some()
    }

    /// Returns true if the entity is a tombstone.
    #[must_use]
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

/// The state of a remote record as last read from the remote store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteSnapshot {
    /// Kind of the collection the record came from.
    pub kind: EntityKind,
    /// Remote record ID.
    pub remote_id: String,
    /// Payload fields.
    pub fields: Fields,
    /// Remote last-modified time.
    pub remote_modified_at: DateTime<Utc>,
    /// Archived (deleted) on the remote side.
    pub archived: bool,
}

impl RemoteSnapshot {
    /// Creates a live snapshot.
    pub fn new(
        kind: EntityKind,
        remote_id: impl Into<String>,
        fields: Fields,
        remote_modified_at: DateTime<Utc>,
    ) -> Self {
        Self {
            kind,
            remote_id: remote_id.into(),
            fields,
            remote_modified_at,
            archived: false,
        }
    }

    /// Human-readable label: the `title` field, else `kind/remote_id`.
    #[must_use]
    pub fn label(&self) -> String {
        label_of(&self.fields)
            .unwrap_or_else(|| format!("{}/{}", self.kind, self.remote_id))
    }

    /// Returns the first non-empty string value among `names`.
    #[must_use]
    pub fn natural_key<'a>(&'a self, names: &[String]) -> Option<(&'a str, &'a str)> {
        names.iter().find_map(|name| {
            self.fields
                .get_key_value(name.as_str())
                .and_then(|(k, v)| v.as_str().filter(|s| !s.is_empty()).map(|s| (k.as_str(), s)))
        })
    }
}

fn label_of(fields: &Fields) -> Option<String> {
    fields
        .get("title")
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn ts(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 2, day, 0, 0, 0).unwrap()
    }

    #[test]
    fn kind_string_roundtrip() {
        for kind in EntityKind::ALL {
            assert_eq!(kind.as_str().parse::<EntityKind>().unwrap(), kind);
        }
        assert_eq!(
            "magazine".parse::<EntityKind>(),
            Err(ModelError::UnknownKind("magazine".into()))
        );
    }

    #[test]
    fn label_prefers_title() {
        let mut fields = Fields::new();
        fields.insert("title".into(), json!("Dune"));
        let entity = Entity::new(EntityKind::Book, "b1", fields, ts(1));
        assert_eq!(entity.label(), "Dune");

        let untitled = Entity::new(EntityKind::ReadingLog, "r9", Fields::new(), ts(1));
        assert_eq!(untitled.label(), "reading_log/r9");
    }

    #[test]
    fn new_entity_is_unlinked() {
        let entity = Entity::new(EntityKind::Book, "b1", Fields::new(), ts(10));
        assert!(!entity.is_linked());
        assert!(!entity.is_deleted());
        assert_eq!(entity.local_modified_at, ts(10));

        let linked = entity.with_remote("page-1", ts(11));
        assert!(linked.is_linked());
        assert_eq!(linked.remote_modified_at, Some(ts(11)));
    }

    #[test]
    fn natural_key_takes_first_present_field() {
        let mut fields = Fields::new();
        fields.insert("isbn".into(), json!(""));
        fields.insert("isbn13".into(), json!("9780441013593"));
        let snapshot = RemoteSnapshot::new(EntityKind::Book, "page-1", fields, ts(3));

        let names = vec!["isbn".to_string(), "isbn13".to_string()];
        assert_eq!(snapshot.natural_key(&names), Some(("isbn13", "9780441013593")));
        assert_eq!(snapshot.natural_key(&["asin".to_string()]), None);
    }

    #[test]
    fn entity_json_shape() {
        let entity = Entity::new(EntityKind::ReadingLog, "r1", Fields::new(), ts(2));
        let value = serde_json::to_value(&entity).unwrap();
        assert_eq!(value["kind"], json!("reading_log"));
        let back: Entity = serde_json::from_value(value).unwrap();
        assert_eq!(back, entity);
    }
}
