//! Index bootstrap: primary key and attribute settings.
//!
//! Attribute lists are only written when an attribute is missing, so
//! restarts against an already configured index issue no settings tasks.

use std::time::Duration;
use tracing::{debug, info};

use crate::storage::traits::{AttributeKind, SearchIndexSink, StorageError};

/// Attributes the change poller classifies on, plus the user search filters.
pub const USER_FILTERABLE: &[&str] = &[
    "id",
    "deleted_at",
    "created_at",
    "updated_at",
    "age",
    "city",
    "state",
    "direction",
    "country",
];
pub const USER_SORTABLE: &[&str] = &["created_at"];

/// Desired shape of one index.
#[derive(Debug, Clone)]
pub struct IndexSpec {
    pub uid: String,
    pub primary_key: String,
    pub filterable: Vec<String>,
    pub sortable: Vec<String>,
}

impl IndexSpec {
    #[must_use]
    pub fn users(uid: impl Into<String>) -> Self {
        Self {
            uid: uid.into(),
            primary_key: "id".to_string(),
            filterable: USER_FILTERABLE.iter().map(|s| s.to_string()).collect(),
            sortable: USER_SORTABLE.iter().map(|s| s.to_string()).collect(),
        }
    }
}

/// Create the index if needed and merge in any missing attribute settings.
#[tracing::instrument(skip(sink, spec), fields(index = %spec.uid))]
pub async fn ensure_index(
    sink: &dyn SearchIndexSink,
    spec: &IndexSpec,
    task_timeout: Duration,
) -> Result<(), StorageError> {
    sink.ensure_index(&spec.uid, &spec.primary_key).await?;

    for (kind, wanted) in [
        (AttributeKind::Filterable, &spec.filterable),
        (AttributeKind::Sortable, &spec.sortable),
    ] {
        let current = sink.get_attributes(&spec.uid, kind).await?;
        let Some(merged) = merge_missing(&current, wanted) else {
            debug!(?kind, "Index attributes already configured");
            continue;
        };
        info!(?kind, attributes = ?merged, "Updating index attributes");
        let task = sink.update_attributes(&spec.uid, kind, &merged).await?;
        sink.wait_for_task(task, task_timeout).await?;
    }
    Ok(())
}

/// `Some(current ∪ wanted)` when at least one wanted attribute is missing.
fn merge_missing(current: &[String], wanted: &[String]) -> Option<Vec<String>> {
    let missing: Vec<&String> = wanted.iter().filter(|w| !current.contains(w)).collect();
    if missing.is_empty() {
        return None;
    }
    let mut merged = current.to_vec();
    merged.extend(missing.into_iter().cloned());
    Some(merged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::InMemoryIndex;

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_merge_missing() {
        assert_eq!(merge_missing(&strings(&["id"]), &strings(&["id"])), None);
        assert_eq!(
            merge_missing(&strings(&["name"]), &strings(&["id", "name"])),
            Some(strings(&["name", "id"]))
        );
        assert_eq!(merge_missing(&[], &strings(&["id"])), Some(strings(&["id"])));
    }

    #[tokio::test]
    async fn test_ensure_index_configures_once() {
        let sink = InMemoryIndex::new();
        let spec = IndexSpec::users("users");

        ensure_index(&sink, &spec, Duration::from_secs(1)).await.unwrap();
        let filterable = sink.get_attributes("users", AttributeKind::Filterable).await.unwrap();
        for attr in USER_FILTERABLE {
            assert!(filterable.iter().any(|a| a == attr));
        }
        let tasks_after_first = sink.task_count();

        ensure_index(&sink, &spec, Duration::from_secs(1)).await.unwrap();
        assert_eq!(sink.task_count(), tasks_after_first);
    }
}
