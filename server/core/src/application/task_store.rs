// Copyright (c) 2026 Personal Server contributors
// SPDX-License-Identifier: MIT

//! Centralized operation state.
//!
//! One mutex-guarded map owns every operation record. Status moves
//! strictly PENDING → RUNNING → one terminal state; once terminal, only
//! the TTL cleanup touches a record. The cancellation handle is a
//! [`CancellationToken`] the sandbox or poll loop listens on, and it is
//! always triggered outside the lock.
//!
//! Construct one store per server and inject it; [`TaskStore::global`]
//! exists for entry points that predate injection.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::domain::operation::OperationStatus;

const DEFAULT_LOG_CAP: usize = 1000;

#[derive(Debug)]
struct TaskRecord {
    status: OperationStatus,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    result: Option<Value>,
    error: Option<String>,
    cancel: Option<CancellationToken>,
    logs: VecDeque<String>,
}

impl TaskRecord {
    fn new() -> Self {
        Self {
            status: OperationStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            result: None,
            error: None,
            cancel: None,
            logs: VecDeque::new(),
        }
    }

    fn snapshot(&self, id: &str) -> TaskSnapshot {
        TaskSnapshot {
            operation_id: id.to_string(),
            status: self.status,
            created_at: self.created_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
            result: self.result.clone(),
            error: self.error.clone(),
            logs: self.logs.iter().cloned().collect(),
        }
    }
}

/// Point-in-time copy of a record, safe to hold without the lock.
#[derive(Debug, Clone)]
pub struct TaskSnapshot {
    pub operation_id: String,
    pub status: OperationStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub logs: Vec<String>,
}

pub struct TaskStore {
    tasks: Mutex<HashMap<String, TaskRecord>>,
    log_cap: usize,
}

impl Default for TaskStore {
    fn default() -> Self {
        Self::new(DEFAULT_LOG_CAP)
    }
}

impl TaskStore {
    pub fn new(log_cap: usize) -> Self {
        Self {
            tasks: Mutex::new(HashMap::new()),
            log_cap,
        }
    }

    /// Process-wide instance for callers without an injected store.
    pub fn global() -> Arc<TaskStore> {
        static GLOBAL: OnceLock<Arc<TaskStore>> = OnceLock::new();
        GLOBAL.get_or_init(|| Arc::new(TaskStore::default())).clone()
    }

    /// Create a record; returns the existing one unchanged if present.
    pub fn create(&self, operation_id: &str) -> TaskSnapshot {
        let mut tasks = self.tasks.lock();
        if tasks.contains_key(operation_id) {
            tracing::warn!(%operation_id, "task already exists");
        }
        tasks
            .entry(operation_id.to_string())
            .or_insert_with(TaskRecord::new)
            .snapshot(operation_id)
    }

    /// Advance a task's status. Terminal records are immutable; an
    /// attempt to move one is ignored with a warning.
    pub fn update_status(
        &self,
        operation_id: &str,
        status: OperationStatus,
        result: Option<Value>,
        error: Option<String>,
    ) -> Option<TaskSnapshot> {
        let mut tasks = self.tasks.lock();
        let record = match tasks.get_mut(operation_id) {
            Some(record) => record,
            None => {
                tracing::error!(%operation_id, "task not found");
                return None;
            }
        };

        if record.status.is_terminal() {
            tracing::warn!(
                %operation_id,
                current = record.status.as_str(),
                requested = status.as_str(),
                "ignoring status update on terminal task"
            );
            return Some(record.snapshot(operation_id));
        }

        record.status = status;
        if status == OperationStatus::Running && record.started_at.is_none() {
            record.started_at = Some(Utc::now());
        }
        if status.is_terminal() {
            record.completed_at = Some(Utc::now());
            record.cancel = None;
        }
        if let Some(result) = result {
            record.result = Some(result);
        }
        if let Some(error) = error {
            record.error = Some(error);
        }

        tracing::info!(%operation_id, status = status.as_str(), "task status updated");
        Some(record.snapshot(operation_id))
    }

    /// Attach the cancellation handle for a live task.
    pub fn set_handle(&self, operation_id: &str, handle: CancellationToken) -> bool {
        let mut tasks = self.tasks.lock();
        match tasks.get_mut(operation_id) {
            Some(record) if !record.status.is_terminal() => {
                record.cancel = Some(handle);
                true
            }
            _ => false,
        }
    }

    /// Cancel a task: marks it CANCELLED and triggers its handle. The
    /// token fires outside the lock. Returns false when the task is
    /// unknown, terminal, or has no handle.
    pub fn cancel(&self, operation_id: &str) -> bool {
        let token = {
            let mut tasks = self.tasks.lock();
            let record = match tasks.get_mut(operation_id) {
                Some(record) => record,
                None => return false,
            };
            if record.status.is_terminal() {
                return false;
            }
            let Some(token) = record.cancel.take() else {
                return false;
            };
            record.status = OperationStatus::Cancelled;
            record.completed_at = Some(Utc::now());
            token
        };

        token.cancel();
        tracing::info!(%operation_id, "task cancelled");
        true
    }

    pub fn get(&self, operation_id: &str) -> Option<TaskSnapshot> {
        self.tasks
            .lock()
            .get(operation_id)
            .map(|record| record.snapshot(operation_id))
    }

    /// Append log lines, discarding the oldest past the ring cap.
    pub fn append_logs<I>(&self, operation_id: &str, lines: I)
    where
        I: IntoIterator<Item = String>,
    {
        let mut tasks = self.tasks.lock();
        if let Some(record) = tasks.get_mut(operation_id) {
            for line in lines {
                if record.logs.len() == self.log_cap {
                    record.logs.pop_front();
                }
                record.logs.push_back(line);
            }
        }
    }

    /// Drop terminal tasks older than `max_age`. Returns how many were
    /// removed.
    pub fn cleanup(&self, max_age: Duration) -> usize {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(max_age).unwrap_or_else(|_| chrono::Duration::hours(1));

        let mut tasks = self.tasks.lock();
        let before = tasks.len();
        tasks.retain(|_, record| match record.completed_at {
            Some(completed) => completed > cutoff,
            None => true,
        });
        let removed = before - tasks.len();
        if removed > 0 {
            tracing::info!(removed, "cleaned up old tasks");
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_is_idempotent() {
        let store = TaskStore::default();
        let first = store.create("op_1");
        store.update_status("op_1", OperationStatus::Running, None, None);
        let again = store.create("op_1");

        assert_eq!(first.status, OperationStatus::Pending);
        // The existing record is returned, not reset.
        assert_eq!(again.status, OperationStatus::Running);
    }

    #[test]
    fn status_is_monotonic() {
        let store = TaskStore::default();
        store.create("op");
        store.update_status("op", OperationStatus::Running, None, None);
        let snap = store
            .update_status("op", OperationStatus::Succeeded, Some(serde_json::json!({"ok": true})), None)
            .unwrap();
        assert!(snap.completed_at.is_some());

        // Terminal records do not move.
        let after = store
            .update_status("op", OperationStatus::Running, None, None)
            .unwrap();
        assert_eq!(after.status, OperationStatus::Succeeded);
    }

    #[test]
    fn started_at_set_once() {
        let store = TaskStore::default();
        store.create("op");
        let first = store
            .update_status("op", OperationStatus::Running, None, None)
            .unwrap();
        let started = first.started_at.unwrap();

        std::thread::sleep(std::time::Duration::from_millis(5));
        let again = store
            .update_status("op", OperationStatus::Running, None, None)
            .unwrap();
        assert_eq!(again.started_at.unwrap(), started);
    }

    #[test]
    fn cancel_fires_handle_and_is_not_repeatable() {
        let store = TaskStore::default();
        store.create("op");
        store.update_status("op", OperationStatus::Running, None, None);

        let token = CancellationToken::new();
        assert!(store.set_handle("op", token.clone()));

        assert!(store.cancel("op"));
        assert!(token.is_cancelled());
        assert_eq!(store.get("op").unwrap().status, OperationStatus::Cancelled);
        assert!(store.get("op").unwrap().completed_at.is_some());

        // Second cancel observes the terminal state.
        assert!(!store.cancel("op"));
        assert_eq!(store.get("op").unwrap().status, OperationStatus::Cancelled);
    }

    #[test]
    fn cancel_without_handle_returns_false() {
        let store = TaskStore::default();
        store.create("op");
        assert!(!store.cancel("op"));
        assert!(!store.cancel("missing"));
    }

    #[test]
    fn handle_cleared_on_terminal() {
        let store = TaskStore::default();
        store.create("op");
        store.update_status("op", OperationStatus::Running, None, None);
        store.set_handle("op", CancellationToken::new());
        store.update_status("op", OperationStatus::Failed, None, Some("boom".into()));

        // Handle was dropped on the terminal transition.
        assert!(!store.cancel("op"));
    }

    #[test]
    fn log_ring_is_bounded() {
        let store = TaskStore::new(3);
        store.create("op");
        store.append_logs("op", (0..5).map(|i| format!("line {i}")));

        let snap = store.get("op").unwrap();
        assert_eq!(snap.logs, vec!["line 2", "line 3", "line 4"]);
    }

    #[test]
    fn cleanup_removes_only_old_terminal_tasks() {
        let store = TaskStore::default();
        store.create("done");
        store.update_status("done", OperationStatus::Succeeded, None, None);
        store.create("live");
        store.update_status("live", OperationStatus::Running, None, None);

        // Zero max-age makes every terminal task eligible.
        std::thread::sleep(std::time::Duration::from_millis(5));
        let removed = store.cleanup(Duration::from_millis(1));
        assert_eq!(removed, 1);
        assert!(store.get("done").is_none());
        assert!(store.get("live").is_some());
    }
}
