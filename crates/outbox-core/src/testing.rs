//! Scriptable in-memory remote service for tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::models::entity_id_of;
use crate::optimistic::merge_values;
use crate::remote::{RemoteError, RemoteResult, RemoteService};

#[derive(Default)]
pub struct MockRemote {
    records: Mutex<HashMap<(String, String), Value>>,
    fetch_overrides: Mutex<HashMap<(String, String), Value>>,
    failures: Mutex<HashMap<String, VecDeque<RemoteError>>>,
    bulk_failure: Mutex<Option<RemoteError>>,
    bulk_limit: Mutex<Option<usize>>,
    delay: Mutex<Option<Duration>>,
    log: Mutex<Vec<String>>,
    calls: AtomicUsize,
    bulk_calls: AtomicUsize,
    generated: AtomicUsize,
}

impl MockRemote {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next call on `target` with `error`
    pub fn fail_next(&self, target: &str, error: RemoteError) {
        self.failures
            .lock()
            .unwrap()
            .entry(target.to_string())
            .or_default()
            .push_back(error);
    }

    /// Fail every bulk insert with `error`
    pub fn fail_bulk(&self, error: RemoteError) {
        *self.bulk_failure.lock().unwrap() = Some(error);
    }

    /// Store and return only the first `limit` records of each bulk insert
    pub fn limit_bulk(&self, limit: usize) {
        *self.bulk_limit.lock().unwrap() = Some(limit);
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    /// Store a record as if another client had written it
    pub fn put_record(&self, target: &str, id: &str, record: Value) {
        self.records
            .lock()
            .unwrap()
            .insert((target.to_string(), id.to_string()), record);
    }

    /// Make `fetch` report `record` regardless of writes
    pub fn override_fetch(&self, target: &str, id: &str, record: Value) {
        self.fetch_overrides
            .lock()
            .unwrap()
            .insert((target.to_string(), id.to_string()), record);
    }

    pub fn record(&self, target: &str, id: &str) -> Option<Value> {
        self.records
            .lock()
            .unwrap()
            .get(&(target.to_string(), id.to_string()))
            .cloned()
    }

    pub fn record_count(&self, target: &str) -> usize {
        self.records
            .lock()
            .unwrap()
            .keys()
            .filter(|(stored_target, _)| stored_target == target)
            .count()
    }

    /// Mutating calls in the order they were applied, as `kind target/id`
    pub fn log(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    /// Every call attempted, including failed and bulk ones
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn bulk_calls(&self) -> usize {
        self.bulk_calls.load(Ordering::SeqCst)
    }

    async fn begin(&self, target: &str) -> RemoteResult<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let failure = self
            .failures
            .lock()
            .unwrap()
            .get_mut(target)
            .and_then(VecDeque::pop_front);
        failure.map_or(Ok(()), Err)
    }

    fn store(&self, target: &str, record: &Value) -> Value {
        let id = entity_id_of(record).unwrap_or_else(|| {
            format!("generated-{}", self.generated.fetch_add(1, Ordering::SeqCst))
        });
        self.log.lock().unwrap().push(format!("insert {target}/{id}"));
        self.put_record(target, &id, record.clone());
        record.clone()
    }
}

#[async_trait]
impl RemoteService for MockRemote {
    async fn insert(&self, target: &str, record: &Value) -> RemoteResult<Value> {
        self.begin(target).await?;
        Ok(self.store(target, record))
    }

    async fn insert_many(&self, target: &str, records: &[Value]) -> RemoteResult<Vec<Value>> {
        self.bulk_calls.fetch_add(1, Ordering::SeqCst);
        let bulk_failure = self.bulk_failure.lock().unwrap().clone();
        if let Some(error) = bulk_failure {
            self.calls.fetch_add(1, Ordering::SeqCst);
            return Err(error);
        }
        self.begin(target).await?;
        let limit = self.bulk_limit.lock().unwrap().unwrap_or(records.len());
        Ok(records
            .iter()
            .take(limit)
            .map(|record| self.store(target, record))
            .collect())
    }

    async fn update(&self, target: &str, id: &str, changes: &Value) -> RemoteResult<Value> {
        self.begin(target).await?;
        self.log.lock().unwrap().push(format!("update {target}/{id}"));
        let key = (target.to_string(), id.to_string());
        let mut records = self.records.lock().unwrap();
        let merged = merge_values(records.get(&key).unwrap_or(&Value::Null), changes);
        records.insert(key, merged.clone());
        Ok(merged)
    }

    async fn delete(&self, target: &str, id: &str) -> RemoteResult<()> {
        self.begin(target).await?;
        self.log.lock().unwrap().push(format!("delete {target}/{id}"));
        self.records
            .lock()
            .unwrap()
            .remove(&(target.to_string(), id.to_string()));
        Ok(())
    }

    async fn fetch(&self, target: &str, id: &str) -> RemoteResult<Option<Value>> {
        let key = (target.to_string(), id.to_string());
        if let Some(record) = self.fetch_overrides.lock().unwrap().get(&key) {
            return Ok(Some(record.clone()));
        }
        Ok(self.records.lock().unwrap().get(&key).cloned())
    }
}
