use chrono::{DateTime, SecondsFormat, Utc};
use std::path::Path;

use crate::error::RamanError;

/// Timestamped run log of operator-visible events (tune retries, drift
/// retunes, autosave points). Rendered into the exported `.log` member.
#[derive(Debug, Clone, Default)]
pub struct Datalog {
    entries: Vec<(DateTime<Utc>, String)>,
}

impl Datalog {
    pub fn new() -> Self {
        Datalog::default()
    }

    pub fn add(&mut self, line: impl Into<String>) {
        self.entries.push((Utc::now(), line.into()));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        for (stamp, line) in &self.entries {
            out.push_str(&stamp.to_rfc3339_opts(SecondsFormat::Secs, true));
            out.push_str(">> ");
            out.push_str(line);
            out.push('\n');
        }
        out
    }

    pub fn save(&self, path: &Path) -> Result<(), RamanError> {
        std::fs::write(path, self.render())
            .map_err(|source| RamanError::io(source, format!("writing datalog to {path:?}")))
    }
}
