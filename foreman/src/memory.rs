//! In-process backend.
//!
//! Emulates the store primitives the engine relies on (counters, hashes, lists with blocking
//! pop, sorted sets ordered by `(score, member)`) behind a single mutex, which makes every
//! operation atomic. Clones share the same store, so a clone plays the role of a connection.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Notify;
use tracing::instrument;

use crate::core::backend::{fifo_member, Backend, BackendError, Connector, Keys, SIGNAL};
use crate::core::job::{fields, millis, Job, JobId, JobState};

#[derive(Default)]
struct Data {
    counters: HashMap<String, u64>,
    hashes: HashMap<String, HashMap<String, String>>,
    lists: HashMap<String, VecDeque<String>>,
    sorted_sets: HashMap<String, BTreeSet<(i64, String)>>,
    sets: HashMap<String, BTreeSet<String>>,
}

impl Data {
    fn hset(&mut self, key: &str, fields: &[(&'static str, String)]) {
        let hash = self.hashes.entry(key.to_string()).or_default();
        for (field, value) in fields {
            hash.insert(field.to_string(), value.clone());
        }
    }

    fn lpush(&mut self, key: &str, value: &str) {
        self.lists
            .entry(key.to_string())
            .or_default()
            .push_front(value.to_string());
    }

    fn lpop(&mut self, key: &str) -> Option<String> {
        let list = self.lists.get_mut(key)?;
        let value = list.pop_front();
        if list.is_empty() {
            self.lists.remove(key);
        }
        value
    }

    fn zadd(&mut self, key: &str, score: i64, member: &str) {
        let set = self.sorted_sets.entry(key.to_string()).or_default();
        set.retain(|(_, m)| m != member);
        set.insert((score, member.to_string()));
    }

    fn zrem(&mut self, key: &str, member: &str) {
        if let Some(set) = self.sorted_sets.get_mut(key) {
            set.retain(|(_, m)| m != member);
            if set.is_empty() {
                self.sorted_sets.remove(key);
            }
        }
    }

    fn zpopmin(&mut self, key: &str) -> Option<(String, i64)> {
        let set = self.sorted_sets.get_mut(key)?;
        let (score, member) = set.pop_first()?;
        if set.is_empty() {
            self.sorted_sets.remove(key);
        }
        Some((member, score))
    }

    fn index(&mut self, keys: &Keys, job: &Job, state: JobState) {
        let member = fifo_member(job.id);
        let score = job.priority.score();
        self.zadd(&keys.state_set(state), score, &member);
        self.zadd(&keys.type_state_set(&job.job_type, state), score, &member);
    }

    fn unindex(&mut self, keys: &Keys, job: &Job, state: JobState) {
        let member = fifo_member(job.id);
        self.zrem(&keys.state_set(state), &member);
        self.zrem(&keys.type_state_set(&job.job_type, state), &member);
    }
}

struct Inner {
    data: Mutex<Data>,
    pushed: Notify,
}

/// Shared in-memory store implementing [`Backend`] and [`Connector`].
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Inner>,
    keys: Keys,
}

impl MemoryStore {
    pub fn new(keys: Keys) -> Self {
        Self {
            inner: Arc::new(Inner {
                data: Mutex::new(Data::default()),
                pushed: Notify::new(),
            }),
            keys,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Data> {
        self.inner.data.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of signals waiting on the signal list of `job_type`.
    pub fn signal_count(&self, job_type: &str) -> usize {
        self.lock()
            .lists
            .get(&self.keys.signal_list(job_type))
            .map_or(0, VecDeque::len)
    }

    /// Members of the sorted set at `key`, lowest score first.
    pub fn members(&self, key: &str) -> Vec<String> {
        self.lock()
            .sorted_sets
            .get(key)
            .map(|set| set.iter().map(|(_, m)| m.clone()).collect())
            .unwrap_or_default()
    }

    /// Add a raw member to a sorted set.
    pub fn insert_member(&self, key: &str, score: i64, member: &str) {
        self.lock().zadd(key, score, member);
    }

    /// Delete only the job record, leaving any index entries behind.
    pub fn delete_record(&self, id: JobId) {
        self.lock().hashes.remove(&self.keys.job(id));
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(Keys::default())
    }
}

#[async_trait]
impl Backend for MemoryStore {
    fn keys(&self) -> &Keys {
        &self.keys
    }

    async fn blocking_pop(
        &self,
        key: &str,
        timeout: std::time::Duration,
    ) -> Result<Option<String>, BackendError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.inner.pushed.notified();
            tokio::pin!(notified);
            // Register before checking so a push in between is not missed.
            notified.as_mut().enable();

            if let Some(value) = self.lock().lpop(key) {
                return Ok(Some(value));
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn pop_min(&self, key: &str) -> Result<Option<(String, i64)>, BackendError> {
        Ok(self.lock().zpopmin(key))
    }

    async fn restore_member(
        &self,
        key: &str,
        member: &str,
        score: i64,
    ) -> Result<(), BackendError> {
        self.lock().zadd(key, score, member);
        Ok(())
    }

    async fn push(&self, key: &str, value: &str) -> Result<(), BackendError> {
        self.lock().lpush(key, value);
        self.inner.pushed.notify_waiters();
        Ok(())
    }

    async fn next_id(&self) -> Result<JobId, BackendError> {
        let mut data = self.lock();
        let counter = data.counters.entry(self.keys.ids()).or_insert(0);
        *counter += 1;
        Ok(*counter)
    }

    #[instrument(skip_all, err, fields(jid = job.id, job_type = %job.job_type))]
    async fn add_job(&self, job: &Job) -> Result<(), BackendError> {
        {
            let mut data = self.lock();
            data.hset(&self.keys.job(job.id), &job.to_record());
            data.sets
                .entry(self.keys.job_types())
                .or_default()
                .insert(job.job_type.clone());
            data.index(&self.keys, job, JobState::Inactive);
            data.lpush(&self.keys.signal_list(&job.job_type), SIGNAL);
        }
        self.inner.pushed.notify_waiters();
        Ok(())
    }

    async fn get_job(&self, id: JobId) -> Result<Option<Job>, BackendError> {
        let data = self.lock();
        data.hashes
            .get(&self.keys.job(id))
            .map(|record| Job::from_record(id, record))
            .transpose()
    }

    async fn set_fields(
        &self,
        id: JobId,
        fields: &[(&'static str, String)],
    ) -> Result<(), BackendError> {
        let mut data = self.lock();
        let key = self.keys.job(id);
        if !data.hashes.contains_key(&key) {
            return Err(BackendError::JobNotFound(id));
        }
        data.hset(&key, fields);
        Ok(())
    }

    #[instrument(skip_all, err, fields(jid = job.id, from = %from, to = %job.state))]
    async fn transition(&self, job: &Job, from: JobState) -> Result<(), BackendError> {
        let requeued = {
            let mut data = self.lock();
            data.hset(&self.keys.job(job.id), &job.to_record());
            data.unindex(&self.keys, job, from);
            data.index(&self.keys, job, job.state);
            if job.state == JobState::Inactive {
                data.lpush(&self.keys.signal_list(&job.job_type), SIGNAL);
            }
            job.state == JobState::Inactive
        };
        if requeued {
            self.inner.pushed.notify_waiters();
        }
        Ok(())
    }

    #[instrument(skip_all, err, fields(jid = id))]
    async fn record_failed_attempt(&self, id: JobId, error: &str) -> Result<Job, BackendError> {
        let mut data = self.lock();
        let record = data
            .hashes
            .get_mut(&self.keys.job(id))
            .ok_or(BackendError::JobNotFound(id))?;

        let read = |record: &HashMap<String, String>, name: &str, default: u32| {
            record
                .get(name)
                .and_then(|raw| raw.parse::<u32>().ok())
                .unwrap_or(default)
        };
        let attempts = read(record, fields::ATTEMPTS, 0);
        let max_attempts = read(record, fields::MAX_ATTEMPTS, 1);
        if attempts < max_attempts {
            record.insert(fields::ATTEMPTS.to_string(), (attempts + 1).to_string());
        }
        let now = millis(Utc::now());
        record.insert(fields::ERROR.to_string(), error.to_string());
        record.insert(fields::FAILED_AT.to_string(), now.clone());
        record.insert(fields::UPDATED_AT.to_string(), now);

        Job::from_record(id, record)
    }

    #[instrument(skip_all, err, fields(jid = job.id))]
    async fn remove_job(&self, job: &Job) -> Result<(), BackendError> {
        let mut data = self.lock();
        for state in JobState::ALL {
            data.unindex(&self.keys, job, state);
        }
        data.hashes.remove(&self.keys.job(job.id));
        Ok(())
    }
}

#[async_trait]
impl Connector for MemoryStore {
    type Backend = MemoryStore;

    async fn connect(&self) -> Result<Self::Backend, BackendError> {
        Ok(self.clone())
    }
}
