//! Changes: named logical operations made of tasks.
//!
//! A change has no stored status. `StateGuard::change_status` derives it from
//! the member tasks every time it is asked, so it can never disagree with the
//! tasks after a reload.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use super::{get_value, set_value, ChangeId, TaskId};
use crate::error::Result;

/// One logical operation, e.g. "install snap foo".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Change {
    pub(crate) id: ChangeId,
    pub(crate) kind: String,
    pub(crate) summary: String,
    pub(crate) spawn_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) ready_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub(crate) task_ids: Vec<TaskId>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub(crate) data: BTreeMap<String, Value>,
}

impl Change {
    pub(crate) fn new(id: ChangeId, kind: &str, summary: &str, now: DateTime<Utc>) -> Self {
        Self {
            id,
            kind: kind.to_string(),
            summary: summary.to_string(),
            spawn_time: now,
            ready_time: None,
            task_ids: Vec::new(),
            data: BTreeMap::new(),
        }
    }

    pub fn id(&self) -> ChangeId {
        self.id
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn summary(&self) -> &str {
        &self.summary
    }

    pub fn spawn_time(&self) -> DateTime<Utc> {
        self.spawn_time
    }

    /// When the change last became ready, if it is ready.
    pub fn ready_time(&self) -> Option<DateTime<Utc>> {
        self.ready_time
    }

    /// Member task ids in the order they were added.
    pub fn task_ids(&self) -> &[TaskId] {
        &self.task_ids
    }

    /// Stores a serializable value under `key`.
    pub fn set<T: Serialize>(&mut self, key: &str, value: &T) -> Result<()> {
        set_value(&mut self.data, key, value)
    }

    /// Reads the value stored under `key`; `Ok(None)` if absent.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        get_value(&self.data, key)
    }

    pub fn data(&self) -> &BTreeMap<String, Value> {
        &self.data
    }
}
