//! Curricular task catalog.
//!
//! `tasks.json` holds the task list as an array of locale→text objects:
//!
//! ```json
//! [
//!   { "en": "Make the robot wave", "nl": "Laat de robot zwaaien" },
//!   { "en": "Walk forward" }
//! ]
//! ```
//!
//! The catalog is loaded once at startup and shared across sessions; each
//! session copies it with completion state reset.

use std::collections::BTreeMap;
use std::path::Path;

use serde::Serialize;
use tokio::fs;
use tracing::{info, warn};

/// One task as broadcast to players and reported over HTTP.
#[derive(Debug, Clone, Serialize)]
pub struct TaskEntry {
    pub key: String,
    pub strings: BTreeMap<String, String>,
    pub completed: bool,
}

#[derive(Debug, Clone, Default)]
pub struct TaskCatalog {
    entries: Vec<TaskEntry>,
}

impl TaskCatalog {
    pub fn parse(data: &str) -> serde_json::Result<Self> {
        let raw: Vec<BTreeMap<String, String>> = serde_json::from_str(data)?;
        let entries = raw
            .into_iter()
            .filter_map(|strings| {
                let key = task_key(&strings)?;
                Some(TaskEntry {
                    key,
                    strings,
                    completed: false,
                })
            })
            .collect();
        Ok(Self { entries })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// A fresh per-session copy, nothing completed yet.
    pub fn session_tasks(&self) -> Vec<TaskEntry> {
        self.entries.clone()
    }
}

/// Load the catalog from disk. A missing or corrupt file yields an empty
/// catalog; sessions then simply have no tasks to offer.
pub async fn load_tasks(path: impl AsRef<Path>) -> TaskCatalog {
    let path = path.as_ref();
    if !path.exists() {
        info!("no {} found, starting with an empty task list", path.display());
        return TaskCatalog::default();
    }

    match fs::read_to_string(path).await {
        Ok(data) => match TaskCatalog::parse(&data) {
            Ok(catalog) => {
                info!("loaded {} tasks from {}", catalog.len(), path.display());
                catalog
            }
            Err(e) => {
                warn!("failed to parse {}: {e}, starting empty", path.display());
                TaskCatalog::default()
            }
        },
        Err(e) => {
            warn!("failed to read {}: {e}, starting empty", path.display());
            TaskCatalog::default()
        }
    }
}

/// Task keys are derived from the canonical locale string with everything but
/// alphanumerics stripped, so they survive URL and JSON round-trips unquoted.
/// Canonical locale is `en` when present, else the first locale.
fn task_key(strings: &BTreeMap<String, String>) -> Option<String> {
    let canonical = strings.get("en").or_else(|| strings.values().next())?;
    let key: String = canonical.chars().filter(|c| c.is_alphanumeric()).collect();
    (!key.is_empty()).then_some(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_come_from_the_english_string_stripped_to_alphanumerics() {
        let catalog = TaskCatalog::parse(
            r#"[
                { "en": "Make the robot wave!", "nl": "Laat de robot zwaaien" },
                { "nl": "Loop vooruit" }
            ]"#,
        )
        .unwrap();

        let tasks = catalog.session_tasks();
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[0].key, "Maketherobotwave");
        assert_eq!(tasks[1].key, "Loopvooruit");
        assert!(tasks.iter().all(|t| !t.completed));
    }

    #[test]
    fn empty_and_unusable_entries_are_skipped() {
        let catalog = TaskCatalog::parse(r#"[ {}, { "en": "!!!" }, { "en": "Ok" } ]"#).unwrap();
        assert_eq!(catalog.len(), 1);
    }

    #[test]
    fn malformed_json_is_an_error() {
        assert!(TaskCatalog::parse("not json").is_err());
        assert!(TaskCatalog::parse(r#"{ "en": "not a list" }"#).is_err());
    }
}
