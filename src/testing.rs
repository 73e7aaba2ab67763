//! In-memory remote store for tests
//!
//! Behaves like a PostgREST table set (create conflicts on duplicate ids,
//! update of a missing row is NotFound) and can be told to fail, stall or
//! assign its own ids.

use crate::mapper::{EntityMapper, RemoteDto, SupabaseMapper};
use crate::remote::{RemoteError, RemoteStore};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteCall {
    pub method: &'static str,
    pub entity_type: String,
    pub id: Option<String>,
}

#[derive(Default)]
pub struct MemoryRemote {
    tables: Mutex<HashMap<String, BTreeMap<String, RemoteDto>>>,
    always_fail: Mutex<Option<RemoteError>>,
    fail_next: Mutex<VecDeque<RemoteError>>,
    delay: Mutex<Option<Duration>>,
    id_prefix: Mutex<Option<String>>,
    calls: Mutex<Vec<RemoteCall>>,
}

impl MemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a row as if written by another device
    pub fn insert(&self, entity_type: &str, dto: RemoteDto) {
        let id = dto.id().unwrap_or_default().to_string();
        self.tables
            .lock()
            .unwrap()
            .entry(entity_type.to_string())
            .or_default()
            .insert(id, dto);
    }

    pub fn row(&self, entity_type: &str, id: &str) -> Option<RemoteDto> {
        self.tables
            .lock()
            .unwrap()
            .get(entity_type)
            .and_then(|table| table.get(id).cloned())
    }

    pub fn len(&self, entity_type: &str) -> usize {
        self.tables
            .lock()
            .unwrap()
            .get(entity_type)
            .map_or(0, BTreeMap::len)
    }

    /// Every call fails with `err` until [`heal`](Self::heal)
    pub fn fail_always(&self, err: RemoteError) {
        *self.always_fail.lock().unwrap() = Some(err);
    }

    /// The next call fails with `err`
    pub fn fail_next(&self, err: RemoteError) {
        self.fail_next.lock().unwrap().push_back(err);
    }

    pub fn heal(&self) {
        *self.always_fail.lock().unwrap() = None;
        self.fail_next.lock().unwrap().clear();
    }

    /// Stall every call for `delay` before answering
    pub fn set_delay(&self, delay: Option<Duration>) {
        *self.delay.lock().unwrap() = delay;
    }

    /// Replace client ids with `{prefix}{client id}` on create
    pub fn assign_ids(&self, prefix: &str) {
        *self.id_prefix.lock().unwrap() = Some(prefix.to_string());
    }

    pub fn calls(&self) -> Vec<RemoteCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self, method: &str) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| c.method == method).count()
    }

    async fn enter(&self, method: &'static str, entity_type: &str, id: Option<&str>) -> Result<(), RemoteError> {
        self.calls.lock().unwrap().push(RemoteCall {
            method,
            entity_type: entity_type.to_string(),
            id: id.map(str::to_string),
        });

        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if let Some(err) = self.fail_next.lock().unwrap().pop_front() {
            return Err(err);
        }
        match self.always_fail.lock().unwrap().clone() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl RemoteStore for MemoryRemote {
    async fn create(&self, entity_type: &str, mut dto: RemoteDto) -> Result<RemoteDto, RemoteError> {
        self.enter("create", entity_type, dto.id()).await?;

        let client_id = dto.id().unwrap_or_default().to_string();
        let id = match self.id_prefix.lock().unwrap().as_deref() {
            Some(prefix) => format!("{}{}", prefix, client_id),
            None => client_id,
        };
        dto.0.insert("id".into(), Value::String(id.clone()));

        let mut tables = self.tables.lock().unwrap();
        let table = tables.entry(entity_type.to_string()).or_default();
        if table.contains_key(&id) {
            return Err(RemoteError::Conflict(format!("duplicate key {}", id)));
        }
        table.insert(id, dto.clone());
        Ok(dto)
    }

    async fn update(&self, entity_type: &str, dto: RemoteDto) -> Result<RemoteDto, RemoteError> {
        self.enter("update", entity_type, dto.id()).await?;

        let id = dto.id().unwrap_or_default().to_string();
        let mut tables = self.tables.lock().unwrap();
        let row = tables
            .get_mut(entity_type)
            .and_then(|table| table.get_mut(&id))
            .ok_or(RemoteError::NotFound)?;
        for (key, value) in dto.0 {
            row.0.insert(key, value);
        }
        Ok(row.clone())
    }

    async fn delete(&self, entity_type: &str, id: &str) -> Result<bool, RemoteError> {
        self.enter("delete", entity_type, Some(id)).await?;

        let removed = self
            .tables
            .lock()
            .unwrap()
            .get_mut(entity_type)
            .and_then(|table| table.remove(id));
        Ok(removed.is_some())
    }

    async fn get_by_id(&self, entity_type: &str, id: &str) -> Result<Option<RemoteDto>, RemoteError> {
        self.enter("get_by_id", entity_type, Some(id)).await?;
        Ok(self.row(entity_type, id))
    }

    async fn get_all(&self, entity_type: &str, since: Option<i64>) -> Result<Vec<RemoteDto>, RemoteError> {
        self.enter("get_all", entity_type, None).await?;

        let rows: Vec<RemoteDto> = self
            .tables
            .lock()
            .unwrap()
            .get(entity_type)
            .map(|table| table.values().cloned().collect())
            .unwrap_or_default();

        Ok(rows
            .into_iter()
            .filter(|dto| match since {
                None => true,
                Some(since) => SupabaseMapper
                    .from_remote(entity_type, dto.clone())
                    .map(|record| record.updated_at >= since)
                    .unwrap_or(true),
            })
            .collect())
    }
}
