//! Repository for `workflow_instances` and `workflow_history`.
//!
//! An `advance`/`resume` transition is one history insert plus one
//! instance update; `record_transition` performs the pair inside a
//! single transaction so the log and the instance row can never
//! disagree.

use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, Row};
use serde_json::{Map, Value};

use crate::db::Database;
use crate::error::PersistenceError;
use crate::models::{HistoryEntry, InstanceStatus, WorkflowInstance};

pub struct InstanceStore {
    db: Database,
}

impl InstanceStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Insert a new instance row. Fails if the instance ID already
    /// exists.
    pub async fn create(&self, instance: &WorkflowInstance) -> Result<(), PersistenceError> {
        let inst = instance.clone();
        self.db
            .with_conn_async(move |conn| {
                conn.execute(
                    "INSERT INTO workflow_instances
                     (instance_id, workflow_name, current_step_name, status, context,
                      created_at, updated_at, completed_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                    rusqlite::params![
                        inst.instance_id,
                        inst.workflow_name,
                        inst.current_step_name,
                        inst.status.as_str(),
                        serde_json::to_string(&inst.context).unwrap_or_default(),
                        inst.created_at.timestamp_millis(),
                        inst.updated_at.timestamp_millis(),
                        inst.completed_at.map(|t| t.timestamp_millis()),
                    ],
                )?;
                Ok(())
            })
            .await
    }

    pub async fn get(&self, instance_id: &str) -> Result<WorkflowInstance, PersistenceError> {
        let id = instance_id.to_string();
        let found = self
            .db
            .with_conn_async(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT instance_id, workflow_name, current_step_name, status, context,
                            created_at, updated_at, completed_at
                     FROM workflow_instances WHERE instance_id = ?1",
                )?;
                stmt.query_row(rusqlite::params![id], row_to_instance)
                    .optional()
            })
            .await?;

        found.ok_or_else(|| PersistenceError::InstanceNotFound(instance_id.to_string()))
    }

    /// Full-record update. `updated_at` is refreshed atomically;
    /// `completed_at` is stamped on the first update that reaches
    /// `COMPLETED` and left untouched thereafter.
    pub async fn update(&self, instance: &WorkflowInstance) -> Result<(), PersistenceError> {
        let inst = instance.clone();
        let rows = self
            .db
            .with_conn_async(move |conn| update_instance_row(conn, &inst))
            .await?;

        if rows == 0 {
            return Err(PersistenceError::InstanceNotFound(
                instance.instance_id.clone(),
            ));
        }
        Ok(())
    }

    /// Delete an instance; history rows cascade.
    pub async fn delete(&self, instance_id: &str) -> Result<(), PersistenceError> {
        let id = instance_id.to_string();
        self.db
            .with_conn_async(move |conn| {
                conn.execute(
                    "DELETE FROM workflow_instances WHERE instance_id = ?1",
                    rusqlite::params![id],
                )?;
                Ok(())
            })
            .await
    }

    /// Append a history entry outside a transition (used by tests and
    /// maintenance paths). Returns the assigned history ID.
    pub async fn append_history(&self, entry: &HistoryEntry) -> Result<i64, PersistenceError> {
        let entry = entry.clone();
        self.db
            .with_conn_async(move |conn| {
                insert_history_row(conn, &entry)?;
                Ok(conn.last_insert_rowid())
            })
            .await
    }

    /// Most-recent-first history for an instance, capped at `limit`.
    pub async fn recent_history(
        &self,
        instance_id: &str,
        limit: usize,
    ) -> Result<Vec<HistoryEntry>, PersistenceError> {
        let id = instance_id.to_string();
        self.db
            .with_conn_async(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT history_id, instance_id, timestamp, step_name, user_report,
                            outcome_status, determined_next_step
                     FROM workflow_history WHERE instance_id = ?1
                     ORDER BY history_id DESC LIMIT ?2",
                )?;
                let rows = stmt
                    .query_map(rusqlite::params![id, limit as i64], row_to_history)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }

    /// Atomically append a history entry and update the instance row.
    /// Either both writes are persisted or neither is.
    pub async fn record_transition(
        &self,
        entry: &HistoryEntry,
        instance: &WorkflowInstance,
    ) -> Result<(), PersistenceError> {
        let entry = entry.clone();
        let inst = instance.clone();
        let updated = self
            .db
            .with_conn_async(move |conn| {
                let tx = conn.unchecked_transaction()?;
                insert_history_row(&tx, &entry)?;
                let rows = update_instance_row(&tx, &inst)?;
                if rows == 0 {
                    // Dropping the transaction rolls the insert back.
                    return Ok(false);
                }
                tx.commit()?;
                Ok(true)
            })
            .await?;

        if !updated {
            return Err(PersistenceError::InstanceNotFound(
                instance.instance_id.clone(),
            ));
        }
        Ok(())
    }
}

fn update_instance_row(
    conn: &Connection,
    inst: &WorkflowInstance,
) -> Result<usize, rusqlite::Error> {
    let now = Utc::now().timestamp_millis();
    let completed = if inst.status == InstanceStatus::Completed {
        Some(now)
    } else {
        None
    };
    // MAX(?, updated_at + 1) keeps updated_at strictly monotonic even
    // for same-millisecond commits.
    conn.execute(
        "UPDATE workflow_instances
         SET workflow_name = ?1,
             current_step_name = ?2,
             status = ?3,
             context = ?4,
             updated_at = MAX(?5, updated_at + 1),
             completed_at = COALESCE(completed_at, ?6)
         WHERE instance_id = ?7",
        rusqlite::params![
            inst.workflow_name,
            inst.current_step_name,
            inst.status.as_str(),
            serde_json::to_string(&inst.context).unwrap_or_default(),
            now,
            completed,
            inst.instance_id,
        ],
    )
}

fn insert_history_row(conn: &Connection, entry: &HistoryEntry) -> Result<(), rusqlite::Error> {
    conn.execute(
        "INSERT INTO workflow_history
         (instance_id, timestamp, step_name, user_report, outcome_status, determined_next_step)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        rusqlite::params![
            entry.instance_id,
            entry.timestamp.timestamp_millis(),
            entry.step_name,
            entry
                .user_report
                .as_ref()
                .map(|r| serde_json::to_string(r).unwrap_or_default()),
            entry.outcome_status,
            entry.determined_next_step,
        ],
    )?;
    Ok(())
}

fn row_to_instance(row: &Row<'_>) -> Result<WorkflowInstance, rusqlite::Error> {
    let context_str: String = row.get(4)?;
    let context: Map<String, Value> = serde_json::from_str(&context_str).unwrap_or_default();
    let status_str: String = row.get(3)?;
    let created_ms: i64 = row.get(5)?;
    let updated_ms: i64 = row.get(6)?;
    let completed_ms: Option<i64> = row.get(7)?;

    Ok(WorkflowInstance {
        instance_id: row.get(0)?,
        workflow_name: row.get(1)?,
        current_step_name: row.get(2)?,
        status: InstanceStatus::from_str(&status_str).unwrap_or(InstanceStatus::Running),
        context,
        created_at: chrono::DateTime::from_timestamp_millis(created_ms)
            .unwrap_or_else(Utc::now),
        updated_at: chrono::DateTime::from_timestamp_millis(updated_ms)
            .unwrap_or_else(Utc::now),
        completed_at: completed_ms.and_then(chrono::DateTime::from_timestamp_millis),
    })
}

fn row_to_history(row: &Row<'_>) -> Result<HistoryEntry, rusqlite::Error> {
    let report_str: Option<String> = row.get(4)?;
    let timestamp_ms: i64 = row.get(2)?;

    Ok(HistoryEntry {
        history_id: row.get(0)?,
        instance_id: row.get(1)?,
        timestamp: chrono::DateTime::from_timestamp_millis(timestamp_ms)
            .unwrap_or_else(Utc::now),
        step_name: row.get(3)?,
        user_report: report_str.and_then(|s| serde_json::from_str(&s).ok()),
        outcome_status: row.get(5)?,
        determined_next_step: row.get(6)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instance(name: &str, step: &str) -> WorkflowInstance {
        WorkflowInstance::new(
            name.to_string(),
            Some(step.to_string()),
            InstanceStatus::Running,
            Map::new(),
        )
    }

    fn entry(instance_id: &str, step: &str) -> HistoryEntry {
        HistoryEntry::new(
            instance_id.to_string(),
            step.to_string(),
            Some(serde_json::json!({"status": "success"})),
            Some("success".to_string()),
        )
    }

    #[tokio::test]
    async fn test_create_get_roundtrip() {
        let store = InstanceStore::new(Database::open_in_memory().unwrap());
        let mut inst = instance("GREET", "greet");
        inst.context
            .insert("a".to_string(), serde_json::json!([1, 2, 3]));
        store.create(&inst).await.unwrap();

        let loaded = store.get(&inst.instance_id).await.unwrap();
        assert_eq!(loaded.workflow_name, "GREET");
        assert_eq!(loaded.current_step_name.as_deref(), Some("greet"));
        assert_eq!(loaded.status, InstanceStatus::Running);
        assert_eq!(loaded.context["a"], serde_json::json!([1, 2, 3]));
        assert!(loaded.completed_at.is_none());
    }

    #[tokio::test]
    async fn test_create_duplicate_id_fails() {
        let store = InstanceStore::new(Database::open_in_memory().unwrap());
        let inst = instance("GREET", "greet");
        store.create(&inst).await.unwrap();
        let err = store.create(&inst).await.unwrap_err();
        assert!(matches!(err, PersistenceError::Query(_)));
    }

    #[tokio::test]
    async fn test_get_missing_is_not_found() {
        let store = InstanceStore::new(Database::open_in_memory().unwrap());
        let err = store.get("nope").await.unwrap_err();
        assert!(matches!(err, PersistenceError::InstanceNotFound(_)));
    }

    #[tokio::test]
    async fn test_update_refreshes_updated_at() {
        let store = InstanceStore::new(Database::open_in_memory().unwrap());
        let inst = instance("GREET", "greet");
        store.create(&inst).await.unwrap();
        let before = store.get(&inst.instance_id).await.unwrap();

        let mut changed = before.clone();
        changed.current_step_name = Some("farewell".to_string());
        store.update(&changed).await.unwrap();

        let after = store.get(&inst.instance_id).await.unwrap();
        assert_eq!(after.current_step_name.as_deref(), Some("farewell"));
        assert!(after.updated_at > before.updated_at);
    }

    #[tokio::test]
    async fn test_completed_at_set_once_and_kept() {
        let store = InstanceStore::new(Database::open_in_memory().unwrap());
        let inst = instance("GREET", "greet");
        store.create(&inst).await.unwrap();

        let mut done = inst.clone();
        done.status = InstanceStatus::Completed;
        done.current_step_name = Some("FINISH".to_string());
        store.update(&done).await.unwrap();

        let first = store.get(&inst.instance_id).await.unwrap();
        let stamp = first.completed_at.expect("completed_at set");

        // A later update must not move the stamp.
        store.update(&first).await.unwrap();
        let second = store.get(&inst.instance_id).await.unwrap();
        assert_eq!(second.completed_at, Some(stamp));
    }

    #[tokio::test]
    async fn test_history_most_recent_first_and_capped() {
        let store = InstanceStore::new(Database::open_in_memory().unwrap());
        let inst = instance("GREET", "greet");
        store.create(&inst).await.unwrap();

        for step in ["a", "b", "c"] {
            store
                .append_history(&entry(&inst.instance_id, step))
                .await
                .unwrap();
        }

        let recent = store.recent_history(&inst.instance_id, 2).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].step_name, "c");
        assert_eq!(recent[1].step_name, "b");
        assert!(recent[0].history_id > recent[1].history_id);
    }

    #[tokio::test]
    async fn test_record_transition_commits_both() {
        let store = InstanceStore::new(Database::open_in_memory().unwrap());
        let inst = instance("GREET", "greet");
        store.create(&inst).await.unwrap();

        let mut advanced = inst.clone();
        advanced.current_step_name = Some("farewell".to_string());
        store
            .record_transition(&entry(&inst.instance_id, "greet"), &advanced)
            .await
            .unwrap();

        let loaded = store.get(&inst.instance_id).await.unwrap();
        assert_eq!(loaded.current_step_name.as_deref(), Some("farewell"));
        let history = store.recent_history(&inst.instance_id, 5).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].step_name, "greet");
    }

    #[tokio::test]
    async fn test_record_transition_rolls_back_history_on_missing_instance() {
        let store = InstanceStore::new(Database::open_in_memory().unwrap());
        let inst = instance("GREET", "greet");
        store.create(&inst).await.unwrap();

        // History insert references the real instance, but the update
        // targets a row that does not exist: the pair must roll back.
        let mut ghost = inst.clone();
        ghost.instance_id = "ghost".to_string();
        let err = store
            .record_transition(&entry(&inst.instance_id, "greet"), &ghost)
            .await
            .unwrap_err();
        assert!(matches!(err, PersistenceError::InstanceNotFound(_)));

        let history = store.recent_history(&inst.instance_id, 5).await.unwrap();
        assert!(history.is_empty());
    }

    #[tokio::test]
    async fn test_delete_cascades_history() {
        let store = InstanceStore::new(Database::open_in_memory().unwrap());
        let inst = instance("GREET", "greet");
        store.create(&inst).await.unwrap();
        store
            .append_history(&entry(&inst.instance_id, "greet"))
            .await
            .unwrap();

        store.delete(&inst.instance_id).await.unwrap();
        let history = store.recent_history(&inst.instance_id, 5).await.unwrap();
        assert!(history.is_empty());
    }

    #[tokio::test]
    async fn test_history_without_instance_rejected() {
        let store = InstanceStore::new(Database::open_in_memory().unwrap());
        let err = store
            .append_history(&entry("orphan", "greet"))
            .await
            .unwrap_err();
        assert!(matches!(err, PersistenceError::Query(_)));
    }
}
