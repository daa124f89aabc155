use std::collections::HashMap;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use foreman::core::backend::{fifo_member, Backend, BackendError, Connector, Keys, SIGNAL};
use foreman::core::job::{Job, JobId, JobState};
use foreman::core::Utc;
use redis::aio::MultiplexedConnection;
use redis::{Client, Pipeline, Script};
use tracing::instrument;

/// Increments `attempts` up to `max_attempts`, stores the error and returns the whole record.
const RECORD_FAILED_ATTEMPT_LUA: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then
    return false
end
local attempts = tonumber(redis.call('HGET', KEYS[1], 'attempts') or '0')
local max_attempts = tonumber(redis.call('HGET', KEYS[1], 'max_attempts') or '1')
if attempts < max_attempts then
    redis.call('HSET', KEYS[1], 'attempts', attempts + 1)
end
redis.call('HSET', KEYS[1], 'error', ARGV[1], 'failed_at', ARGV[2], 'updated_at', ARGV[2])
return redis.call('HGETALL', KEYS[1])
"#;

/// Sets fields of an existing record only.
const SET_FIELDS_LUA: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then
    return 0
end
redis.call('HSET', KEYS[1], unpack(ARGV))
return 1
"#;

/// Opens one multiplexed connection per worker.
#[derive(Clone)]
pub struct RedisConnector {
    client: Client,
    keys: Keys,
}

impl RedisConnector {
    pub fn new(client: Client, keys: Keys) -> Self {
        Self { client, keys }
    }

    /// Create a connector from a `redis://` URL.
    pub fn open(url: &str, keys: Keys) -> Result<Self, BackendError> {
        let client = Client::open(url).with_context(|| "Failed to create Redis client")?;
        Ok(Self::new(client, keys))
    }
}

#[async_trait]
impl Connector for RedisConnector {
    type Backend = RedisBackend;

    #[instrument(skip_all, err, fields(prefix = self.keys.prefix()))]
    async fn connect(&self) -> Result<Self::Backend, BackendError> {
        let conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .context("Failed to connect to Redis")?;
        Ok(RedisBackend::with_connection(conn, self.keys.clone()))
    }
}

/// Backend over a single Redis connection.
///
/// A blocking pop holds the connection for its whole duration, so each worker needs its own.
#[derive(Clone)]
pub struct RedisBackend {
    conn: MultiplexedConnection,
    keys: Keys,
    record_failed_attempt_script: Script,
    set_fields_script: Script,
}

impl RedisBackend {
    pub fn with_connection(conn: MultiplexedConnection, keys: Keys) -> Self {
        Self {
            conn,
            keys,
            record_failed_attempt_script: Script::new(RECORD_FAILED_ATTEMPT_LUA),
            set_fields_script: Script::new(SET_FIELDS_LUA),
        }
    }

    fn index(&self, pipe: &mut Pipeline, job: &Job, state: JobState) {
        let member = fifo_member(job.id);
        let score = job.priority.score();
        pipe.zadd(self.keys.state_set(state), &member, score).ignore();
        pipe.zadd(self.keys.type_state_set(&job.job_type, state), &member, score)
            .ignore();
    }

    fn unindex(&self, pipe: &mut Pipeline, job: &Job, state: JobState) {
        let member = fifo_member(job.id);
        pipe.zrem(self.keys.state_set(state), &member).ignore();
        pipe.zrem(self.keys.type_state_set(&job.job_type, state), &member)
            .ignore();
    }
}

#[async_trait]
impl Backend for RedisBackend {
    fn keys(&self) -> &Keys {
        &self.keys
    }

    async fn blocking_pop(
        &self,
        key: &str,
        timeout: Duration,
    ) -> Result<Option<String>, BackendError> {
        let mut conn = self.conn.clone();
        let popped: Option<(String, String)> = redis::cmd("BLPOP")
            .arg(key)
            .arg(timeout.as_secs_f64())
            .query_async(&mut conn)
            .await
            .with_context(|| format!("BLPOP {key} failed"))?;
        Ok(popped.map(|(_, value)| value))
    }

    async fn pop_min(&self, key: &str) -> Result<Option<(String, i64)>, BackendError> {
        let mut conn = self.conn.clone();
        let popped: Vec<String> = redis::cmd("ZPOPMIN")
            .arg(key)
            .query_async(&mut conn)
            .await
            .with_context(|| format!("ZPOPMIN {key} failed"))?;

        let mut popped = popped.into_iter();
        let (Some(member), Some(score)) = (popped.next(), popped.next()) else {
            return Ok(None);
        };
        let score = score
            .parse::<f64>()
            .with_context(|| format!("Invalid score '{score}' for '{member}'"))?;
        Ok(Some((member, score as i64)))
    }

    async fn restore_member(
        &self,
        key: &str,
        member: &str,
        score: i64,
    ) -> Result<(), BackendError> {
        let mut conn = self.conn.clone();
        redis::cmd("ZADD")
            .arg(key)
            .arg(score)
            .arg(member)
            .query_async::<()>(&mut conn)
            .await
            .with_context(|| format!("ZADD {key} {member} failed"))?;
        Ok(())
    }

    async fn push(&self, key: &str, value: &str) -> Result<(), BackendError> {
        let mut conn = self.conn.clone();
        redis::cmd("LPUSH")
            .arg(key)
            .arg(value)
            .query_async::<()>(&mut conn)
            .await
            .with_context(|| format!("LPUSH {key} failed"))?;
        Ok(())
    }

    async fn next_id(&self) -> Result<JobId, BackendError> {
        let mut conn = self.conn.clone();
        let id: JobId = redis::cmd("INCR")
            .arg(self.keys.ids())
            .query_async(&mut conn)
            .await
            .context("Failed to issue job id")?;
        Ok(id)
    }

    #[instrument(skip_all, err, fields(jid = job.id, job_type = %job.job_type))]
    async fn add_job(&self, job: &Job) -> Result<(), BackendError> {
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.hset_multiple(self.keys.job(job.id), &job.to_record())
            .ignore();
        pipe.sadd(self.keys.job_types(), &job.job_type).ignore();
        self.index(&mut pipe, job, JobState::Inactive);
        pipe.lpush(self.keys.signal_list(&job.job_type), SIGNAL)
            .ignore();
        pipe.query_async::<()>(&mut conn)
            .await
            .context("Failed to add job")?;
        Ok(())
    }

    async fn get_job(&self, id: JobId) -> Result<Option<Job>, BackendError> {
        let mut conn = self.conn.clone();
        let record: HashMap<String, String> = redis::cmd("HGETALL")
            .arg(self.keys.job(id))
            .query_async(&mut conn)
            .await
            .with_context(|| format!("Failed to load job {id}"))?;
        if record.is_empty() {
            return Ok(None);
        }
        Job::from_record(id, &record).map(Some)
    }

    async fn set_fields(
        &self,
        id: JobId,
        fields: &[(&'static str, String)],
    ) -> Result<(), BackendError> {
        if fields.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        let mut invocation = self.set_fields_script.key(self.keys.job(id));
        for (field, value) in fields {
            invocation.arg(*field).arg(value);
        }
        let updated: i64 = invocation
            .invoke_async(&mut conn)
            .await
            .with_context(|| format!("Failed to update job {id}"))?;
        if updated == 0 {
            return Err(BackendError::JobNotFound(id));
        }
        Ok(())
    }

    #[instrument(skip_all, err, fields(jid = job.id, from = %from, to = %job.state))]
    async fn transition(&self, job: &Job, from: JobState) -> Result<(), BackendError> {
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.hset_multiple(self.keys.job(job.id), &job.to_record())
            .ignore();
        self.unindex(&mut pipe, job, from);
        self.index(&mut pipe, job, job.state);
        if job.state == JobState::Inactive {
            pipe.lpush(self.keys.signal_list(&job.job_type), SIGNAL)
                .ignore();
        }
        pipe.query_async::<()>(&mut conn)
            .await
            .context("Failed to persist transition")?;
        Ok(())
    }

    #[instrument(skip_all, err, fields(jid = id))]
    async fn record_failed_attempt(&self, id: JobId, error: &str) -> Result<Job, BackendError> {
        let mut conn = self.conn.clone();
        let now = Utc::now().timestamp_millis().to_string();
        let record: Option<HashMap<String, String>> = self
            .record_failed_attempt_script
            .key(self.keys.job(id))
            .arg(error)
            .arg(now)
            .invoke_async(&mut conn)
            .await
            .context("Failed to record failed attempt")?;
        let record = record.ok_or(BackendError::JobNotFound(id))?;
        Job::from_record(id, &record)
    }

    #[instrument(skip_all, err, fields(jid = job.id))]
    async fn remove_job(&self, job: &Job) -> Result<(), BackendError> {
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        pipe.atomic();
        for state in JobState::ALL {
            self.unindex(&mut pipe, job, state);
        }
        pipe.del(self.keys.job(job.id)).ignore();
        pipe.query_async::<()>(&mut conn)
            .await
            .context("Failed to remove job")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use foreman::core::job::fields;

    #[test]
    fn test_failed_attempt_script_uses_record_fields() {
        for field in [
            fields::ATTEMPTS,
            fields::MAX_ATTEMPTS,
            fields::ERROR,
            fields::FAILED_AT,
            fields::UPDATED_AT,
        ] {
            assert!(
                RECORD_FAILED_ATTEMPT_LUA.contains(&format!("'{field}'")),
                "script does not reference '{field}'"
            );
        }
    }

    #[test]
    fn test_open_rejects_bad_url() {
        assert!(matches!(
            RedisConnector::open("not a url", Keys::default()),
            Err(BackendError::Store(_))
        ));
    }
}
