//! Interactive conflict resolution on the terminal.

use parking_lot::Mutex;
use serde_json::Value;
use shelfsync_model::{Fields, Resolution, ResolutionPolicy, SyncConflict};
use std::collections::BTreeSet;
use std::io::{self, BufRead, Write};

const COLUMN: usize = 32;

/// Asks the user to resolve each conflict.
///
/// The comparison is written to `output` and the choice read from `input`:
/// `1` keeps remote (also the default on an empty line or end of input),
/// `2` keeps local, `3` skips.
pub struct PromptPolicy<R, W> {
    io: Mutex<(R, W)>,
}

impl PromptPolicy<io::StdinLock<'static>, io::Stderr> {
    /// Prompts on stderr and reads from stdin.
    pub fn terminal() -> Self {
        Self::new(io::stdin().lock(), io::stderr())
    }
}

impl<R: BufRead, W: Write> PromptPolicy<R, W> {
    /// Creates a prompt over arbitrary streams.
    pub fn new(input: R, output: W) -> Self {
        Self {
            io: Mutex::new((input, output)),
        }
    }

    fn ask(&self, conflict: &SyncConflict) -> io::Result<Resolution> {
        let mut guard = self.io.lock();
        let (input, output) = &mut *guard;

        render(output, conflict)?;
        loop {
            write!(output, "Keep [1] remote  [2] local  [3] skip (default 1): ")?;
            output.flush()?;

            let mut line = String::new();
            if input.read_line(&mut line)? == 0 {
                writeln!(output)?;
                return Ok(Resolution::KeepRemote);
            }
            match line.trim() {
                "" | "1" => return Ok(Resolution::KeepRemote),
                "2" => return Ok(Resolution::KeepLocal),
                "3" => return Ok(Resolution::Skip),
                other => writeln!(output, "'{other}' is not a choice")?,
            }
        }
    }
}

impl<R: BufRead, W: Write> ResolutionPolicy for PromptPolicy<R, W> {
    fn resolve(&self, conflict: &SyncConflict) -> Resolution {
        self.ask(conflict).unwrap_or(Resolution::KeepRemote)
    }
}

fn render(out: &mut impl Write, conflict: &SyncConflict) -> io::Result<()> {
    let empty = Fields::new();
    let local = conflict.local.as_ref().map_or(&empty, |e| &e.fields);
    let remote = conflict.remote.as_ref().map_or(&empty, |r| &r.fields);

    writeln!(out)?;
    writeln!(out, "Conflict ({}): {}", conflict.conflict_type, conflict.label())?;
    writeln!(
        out,
        "  {:<16} {:<COLUMN$} {:<COLUMN$}",
        "",
        stamp("local", conflict.local.is_some(), conflict.local_modified_at),
        stamp("remote", conflict.remote.is_some(), conflict.remote_modified_at),
    )?;

    let names: BTreeSet<&String> = local.keys().chain(remote.keys()).collect();
    for name in names {
        let l = local.get(name);
        let r = remote.get(name);
        let marker = if l == r { ' ' } else { '*' };
        writeln!(
            out,
            "{marker} {:<16} {:<COLUMN$} {:<COLUMN$}",
            clip(name, 16),
            clip(&show(l), COLUMN),
            clip(&show(r), COLUMN),
        )?;
    }
    Ok(())
}

fn stamp(side: &str, present: bool, at: Option<chrono::DateTime<chrono::Utc>>) -> String {
    match (present, at) {
        (false, _) => format!("{side} (missing)"),
        (true, Some(at)) => format!("{side} @ {}", at.format("%Y-%m-%d %H:%M")),
        (true, None) => side.to_string(),
    }
}

fn show(value: Option<&Value>) -> String {
    match value {
        None => "-".to_string(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

fn clip(text: &str, width: usize) -> String {
    if text.chars().count() <= width {
        return text.to_string();
    }
    let mut clipped: String = text.chars().take(width.saturating_sub(1)).collect();
    clipped.push('~');
    clipped
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use serde_json::json;
    use shelfsync_model::{detect, Entity, EntityKind, RemoteSnapshot};

    fn conflict() -> SyncConflict {
        let mut local_fields = Fields::new();
        local_fields.insert("title".into(), json!("Dune"));
        local_fields.insert("rating".into(), json!(4));
        let mut remote_fields = local_fields.clone();
        remote_fields.insert("rating".into(), json!(5));

        let last_sync = Utc.with_ymd_and_hms(2025, 3, 1, 0, 0, 0).unwrap();
        let local = Entity::new(
            EntityKind::Book,
            "b1",
            local_fields,
            Utc.with_ymd_and_hms(2025, 3, 2, 0, 0, 0).unwrap(),
        )
        .with_remote("page-1", last_sync);
        let remote = RemoteSnapshot::new(
            EntityKind::Book,
            "page-1",
            remote_fields,
            Utc.with_ymd_and_hms(2025, 3, 3, 0, 0, 0).unwrap(),
        );
        detect(Some(&local), Some(&remote), Some(last_sync)).unwrap()
    }

    fn answer(input: &str) -> (Resolution, String) {
        let policy = PromptPolicy::new(input.as_bytes(), Vec::new());
        let resolution = policy.resolve(&conflict());
        let (_, output) = policy.io.into_inner();
        (resolution, String::from_utf8(output).unwrap())
    }

    #[test]
    fn choices() {
        assert_eq!(answer("1\n").0, Resolution::KeepRemote);
        assert_eq!(answer("2\n").0, Resolution::KeepLocal);
        assert_eq!(answer("3\n").0, Resolution::Skip);
        assert_eq!(answer("\n").0, Resolution::KeepRemote);
        assert_eq!(answer("").0, Resolution::KeepRemote);
    }

    #[test]
    fn invalid_input_asks_again() {
        let (resolution, output) = answer("9\n2\n");
        assert_eq!(resolution, Resolution::KeepLocal);
        assert!(output.contains("'9' is not a choice"));
    }

    #[test]
    fn comparison_marks_differing_fields() {
        let (_, output) = answer("1\n");
        assert!(output.contains("Conflict (both_modified): Dune"));
        let rating = output.lines().find(|l| l.contains("rating")).unwrap();
        assert!(rating.starts_with('*'));
        let title = output.lines().find(|l| l.contains("title")).unwrap();
        assert!(title.starts_with(' '));
    }

    #[test]
    fn clip_long_values() {
        assert_eq!(clip("abcdef", 4), "abc~");
        assert_eq!(clip("abc", 4), "abc");
    }
}
