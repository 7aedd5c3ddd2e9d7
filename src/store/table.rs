//! Generic in-memory table with snapshot reads and guarded state writes.

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt::Display;
use std::hash::Hash;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::state::{EntityKind, ExecutionState, ExecutionTimes, StateMachine, Transition};
use crate::types::{Error, Result};

/// A persisted entity.
pub trait Record: Clone + Default + Serialize + Send + Sync + 'static {
    const KIND: &'static str;
    type Id: Clone + Eq + Hash + Display + Send + Sync + 'static;

    fn id(&self) -> &Self::Id;
}

/// A record driven by a state machine.
pub trait Stateful: Record {
    const ENTITY: EntityKind;

    fn state(&self) -> ExecutionState;
    fn set_state(&mut self, state: ExecutionState);
    fn times_mut(&mut self) -> &mut ExecutionTimes;
}

/// Equality filter over a record's serialized fields.
#[derive(Debug, Clone, Default)]
pub struct Filter {
    fields: Vec<(String, Value)>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn field(mut self, field: impl Into<String>, value: impl Serialize) -> Self {
        let value = serde_json::to_value(value).unwrap_or(Value::Null);
        self.fields.push((field.into(), value));
        self
    }

    fn matches(&self, record: &Value) -> bool {
        self.fields
            .iter()
            .all(|(field, expected)| record.get(field) == Some(expected))
    }
}

/// Table of records keyed by id. Clones share storage.
pub struct Table<R: Record> {
    rows: Arc<RwLock<HashMap<R::Id, R>>>,
    fields: Arc<Vec<String>>,
}

impl<R: Record> Clone for Table<R> {
    fn clone(&self) -> Self {
        Self {
            rows: Arc::clone(&self.rows),
            fields: Arc::clone(&self.fields),
        }
    }
}

impl<R: Record> std::fmt::Debug for Table<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Table").field("kind", &R::KIND).finish()
    }
}

impl<R: Record> Default for Table<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: Record> Table<R> {
    pub fn new() -> Self {
        // Field names come from the serialized default record.
        let fields = match serde_json::to_value(R::default()) {
            Ok(Value::Object(map)) => map.keys().cloned().collect(),
            _ => Vec::new(),
        };
        Self {
            rows: Arc::new(RwLock::new(HashMap::new())),
            fields: Arc::new(fields),
        }
    }

    pub async fn create(&self, record: R) -> Result<R> {
        let mut rows = self.rows.write().await;
        if rows.contains_key(record.id()) {
            return Err(Error::validation(format!(
                "{} {} already exists",
                R::KIND,
                record.id()
            )));
        }
        rows.insert(record.id().clone(), record.clone());
        Ok(record)
    }

    /// Snapshot of the record with `id`.
    pub async fn get(&self, id: &R::Id) -> Result<R> {
        self.rows
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("{} {}", R::KIND, id)))
    }

    pub async fn exists(&self, id: &R::Id) -> bool {
        self.rows.read().await.contains_key(id)
    }

    pub async fn all(&self) -> Vec<R> {
        self.rows.read().await.values().cloned().collect()
    }

    /// Records whose fields equal every pair of `filter`.
    pub async fn filter(&self, filter: &Filter) -> Result<Vec<R>> {
        if let Some((field, _)) = filter
            .fields
            .iter()
            .find(|(field, _)| !self.fields.contains(field))
        {
            return Err(Error::invalid_filter(format!(
                "{} has no field '{}'",
                R::KIND,
                field
            )));
        }
        let rows = self.rows.read().await;
        let mut matched = Vec::new();
        for record in rows.values() {
            let value = serde_json::to_value(record)?;
            if filter.matches(&value) {
                matched.push(record.clone());
            }
        }
        Ok(matched)
    }

    /// Apply `mutate` to the stored record and return the new snapshot.
    pub async fn update<F>(&self, id: &R::Id, mutate: F) -> Result<R>
    where
        F: FnOnce(&mut R),
    {
        let mut rows = self.rows.write().await;
        let record = rows
            .get_mut(id)
            .ok_or_else(|| Error::not_found(format!("{} {}", R::KIND, id)))?;
        mutate(record);
        Ok(record.clone())
    }

    pub async fn delete(&self, id: &R::Id) -> Result<R> {
        self.rows
            .write()
            .await
            .remove(id)
            .ok_or_else(|| Error::not_found(format!("{} {}", R::KIND, id)))
    }
}

impl<R: Stateful> Table<R> {
    /// Validate `current → to` and write it. Returns `false` when the record
    /// was already in `to`.
    pub async fn transition(&self, id: &R::Id, to: ExecutionState) -> Result<bool> {
        let mut rows = self.rows.write().await;
        let record = rows
            .get_mut(id)
            .ok_or_else(|| Error::not_found(format!("{} {}", R::KIND, id)))?;
        apply(record, to)
    }

    /// Like [`Table::transition`] but first requires the current state to be
    /// in `allowed` (InvalidState otherwise).
    pub async fn transition_from(
        &self,
        id: &R::Id,
        allowed: &[ExecutionState],
        to: ExecutionState,
    ) -> Result<bool> {
        let mut rows = self.rows.write().await;
        let record = rows
            .get_mut(id)
            .ok_or_else(|| Error::not_found(format!("{} {}", R::KIND, id)))?;
        StateMachine::for_kind(R::ENTITY).validate_state(record.state(), allowed)?;
        apply(record, to)
    }

    /// Write `new` only if the state is still `expected`.
    pub async fn compare_and_set_state(
        &self,
        id: &R::Id,
        expected: ExecutionState,
        new: ExecutionState,
    ) -> Result<bool> {
        let mut rows = self.rows.write().await;
        let record = rows
            .get_mut(id)
            .ok_or_else(|| Error::not_found(format!("{} {}", R::KIND, id)))?;
        if record.state() != expected {
            return Ok(false);
        }
        apply(record, new)
    }
}

fn apply<R: Stateful>(record: &mut R, to: ExecutionState) -> Result<bool> {
    let from = record.state();
    match StateMachine::for_kind(R::ENTITY).validate_transition(from, to)? {
        Transition::Unchanged => Ok(false),
        Transition::Apply => {
            record.set_state(to);
            record.times_mut().on_transition(to, Utc::now());
            tracing::debug!(kind = R::KIND, id = %record.id(), %from, %to, "state transition");
            Ok(true)
        }
    }
}
