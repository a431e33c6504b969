//! Redis Broker
//!
//! Shares the job ledger and the task/report queues between scheduler and
//! worker processes. Every state-dependent lease transition runs as one Lua
//! script so two processes never observe a half-applied lease.
//!
//! ## Key Layout
//! All keys live under a configurable prefix `{p}`:
//! - `{p}:job:{job}`: job record (JSON)
//! - `{p}:jobs`: sorted set of job ids scored by creation time
//! - `{p}:dispatch`: sorted set of queued job ids scored by `next_dispatch_at`
//! - `{p}:cancelled`: set of cancelled job ids (the lease gate)
//! - `{p}:matches:{job}:{task}`: list of one task's match records (JSON)
//! - `{p}:match_counts:{job}`: hash of task id to match list length
//! - `{p}:task:{job}/{task}`: task hash (`objects`, `attempts`, `state`,
//!   `lease_id`, `worker`, `expires_at`, `created_at`, `updated_at`)
//! - `{p}:tasks:{job}`: sorted set of task ids of a job
//! - `{p}:ready`: list of `{job}/{task}` members waiting for a worker
//! - `{p}:leases`: sorted set of leased members scored by lease expiry
//! - `{p}:reports`: list of task reports (JSON)

use super::broker::Broker;
use super::error::BrokerError;
use crate::jobs::types::*;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

/// Poll interval of the blocking waits (`lease`, `next_report`).
const POLL_INTERVAL: Duration = Duration::from_millis(100);

mod scripts {
    use redis::Script;

    /// Pops ready members until one is pending and not cancelled, then
    /// leases it. Returns the member or nil.
    pub fn lease() -> Script {
        Script::new(
            r#"
            local prefix = ARGV[1]
            while true do
                local member = redis.call('LPOP', KEYS[1])
                if not member then
                    return false
                end
                local sep = string.find(member, '/', 1, true)
                local job = string.sub(member, 1, sep - 1)
                if redis.call('SISMEMBER', KEYS[2], job) == 0 then
                    local task = prefix .. ':task:' .. member
                    if redis.call('HGET', task, 'state') == 'pending' then
                        redis.call('HSET', task,
                            'state', 'leased',
                            'lease_id', ARGV[2],
                            'worker', ARGV[3],
                            'expires_at', ARGV[4],
                            'updated_at', ARGV[5])
                        redis.call('ZADD', KEYS[3], ARGV[4], member)
                        return member
                    end
                end
            end
            "#,
        )
    }

    pub fn renew() -> Script {
        Script::new(
            r#"
            if redis.call('HGET', KEYS[1], 'state') ~= 'leased' then
                return 0
            end
            if redis.call('HGET', KEYS[1], 'lease_id') ~= ARGV[1] then
                return 0
            end
            redis.call('HSET', KEYS[1], 'expires_at', ARGV[2], 'updated_at', ARGV[4])
            redis.call('ZADD', KEYS[2], ARGV[2], ARGV[3])
            return 1
            "#,
        )
    }

    pub fn requeue() -> Script {
        Script::new(
            r#"
            if redis.call('HGET', KEYS[1], 'state') ~= 'leased' then
                return 0
            end
            local held = redis.call('HGET', KEYS[1], 'lease_id')
            if held and held ~= ARGV[1] then
                return 0
            end
            redis.call('HINCRBY', KEYS[1], 'attempts', 1)
            redis.call('HSET', KEYS[1], 'state', 'pending', 'updated_at', ARGV[3])
            redis.call('HDEL', KEYS[1], 'lease_id', 'worker', 'expires_at')
            redis.call('ZREM', KEYS[3], ARGV[2])
            redis.call('RPUSH', KEYS[2], ARGV[2])
            return 1
            "#,
        )
    }

    pub fn settle() -> Script {
        Script::new(
            r#"
            if redis.call('EXISTS', KEYS[1]) == 0 then
                return 0
            end
            redis.call('HSET', KEYS[1], 'state', ARGV[1], 'updated_at', ARGV[3])
            redis.call('HDEL', KEYS[1], 'lease_id', 'worker', 'expires_at')
            redis.call('ZREM', KEYS[2], ARGV[2])
            return 1
            "#,
        )
    }
}

struct Scripts {
    lease: Script,
    renew: Script,
    requeue: Script,
    settle: Script,
}

#[derive(Clone)]
struct Keys {
    prefix: String,
}

impl Keys {
    fn job(&self, job_id: &JobId) -> String {
        format!("{}:job:{}", self.prefix, job_id)
    }

    fn jobs(&self) -> String {
        format!("{}:jobs", self.prefix)
    }

    fn dispatch(&self) -> String {
        format!("{}:dispatch", self.prefix)
    }

    fn cancelled(&self) -> String {
        format!("{}:cancelled", self.prefix)
    }

    fn task_matches(&self, job_id: &JobId, task_id: TaskId) -> String {
        format!("{}:matches:{}:{}", self.prefix, job_id, task_id)
    }

    fn match_counts(&self, job_id: &JobId) -> String {
        format!("{}:match_counts:{}", self.prefix, job_id)
    }

    fn task(&self, key: &TaskKey) -> String {
        format!("{}:task:{}", self.prefix, key)
    }

    fn tasks(&self, job_id: &JobId) -> String {
        format!("{}:tasks:{}", self.prefix, job_id)
    }

    fn ready(&self) -> String {
        format!("{}:ready", self.prefix)
    }

    fn leases(&self) -> String {
        format!("{}:leases", self.prefix)
    }

    fn reports(&self) -> String {
        format!("{}:reports", self.prefix)
    }
}

pub struct RedisBroker {
    conn: ConnectionManager,
    keys: Keys,
    scripts: Scripts,
}

impl RedisBroker {
    /// Connects to `redis_url` and namespaces every key under `prefix`.
    pub async fn connect(redis_url: &str, prefix: &str) -> Result<Self, BrokerError> {
        let client = redis::Client::open(redis_url)?;
        let conn = ConnectionManager::new(client).await?;

        tracing::info!("Connected to redis broker (prefix '{}')", prefix);

        Ok(Self {
            conn,
            keys: Keys {
                prefix: prefix.to_string(),
            },
            scripts: Scripts {
                lease: scripts::lease(),
                renew: scripts::renew(),
                requeue: scripts::requeue(),
                settle: scripts::settle(),
            },
        })
    }

    async fn load_task(&self, key: &TaskKey) -> Result<Option<TaskRecord>, BrokerError> {
        let mut conn = self.conn.clone();
        let fields: HashMap<String, String> = conn.hgetall(self.keys.task(key)).await?;
        decode_task(key, fields)
    }
}

/// Rebuilds a task record from its hash. An empty hash means no such task.
fn decode_task(
    key: &TaskKey,
    mut fields: HashMap<String, String>,
) -> Result<Option<TaskRecord>, BrokerError> {
    if fields.is_empty() {
        return Ok(None);
    }

    let corrupt = |reason: &str| BrokerError::Corrupt {
        key: key.to_string(),
        reason: reason.to_string(),
    };
    let number = |fields: &HashMap<String, String>, name: &str| -> Result<u64, BrokerError> {
        fields
            .get(name)
            .and_then(|raw| raw.parse().ok())
            .ok_or_else(|| corrupt(&format!("missing or invalid '{}'", name)))
    };

    let objects: Vec<_> = match fields.get("objects") {
        Some(raw) => serde_json::from_str(raw)?,
        None => return Err(corrupt("missing 'objects'")),
    };
    let state = fields
        .get("state")
        .and_then(|raw| TaskState::parse(raw))
        .ok_or_else(|| corrupt("missing or invalid 'state'"))?;

    let lease = match (fields.remove("lease_id"), fields.remove("worker")) {
        (Some(lease_id), Some(worker)) => Some(Lease {
            lease_id: LeaseId(lease_id),
            worker: WorkerId(worker),
            expires_at: number(&fields, "expires_at")?,
        }),
        _ => None,
    };

    Ok(Some(TaskRecord {
        key: key.clone(),
        objects,
        attempts: number(&fields, "attempts")? as u32,
        state,
        lease,
        created_at: number(&fields, "created_at")?,
        updated_at: number(&fields, "updated_at")?,
    }))
}

/// Splits the page `[offset, offset + limit)` of the concatenated per-task
/// match lists into one inclusive `(task, start, stop)` range per list.
///
/// `counts` is ordered by task id.
fn page_plan(counts: &[(TaskId, usize)], offset: usize, limit: usize) -> Vec<(TaskId, usize, usize)> {
    let mut plan = Vec::new();
    let mut skip = offset;
    let mut wanted = limit;

    for &(task_id, count) in counts {
        if wanted == 0 {
            break;
        }
        if skip >= count {
            skip -= count;
            continue;
        }

        let take = (count - skip).min(wanted);
        plan.push((task_id, skip, skip + take - 1));
        wanted -= take;
        skip = 0;
    }

    plan
}

fn list_index(index: usize) -> isize {
    isize::try_from(index).unwrap_or(isize::MAX)
}

#[async_trait]
impl Broker for RedisBroker {
    async fn put_job(&self, job: &JobRecord) -> Result<(), BrokerError> {
        let payload = serde_json::to_string(job)?;
        let member = job.id.to_string();
        let mut conn = self.conn.clone();

        let mut pipe = redis::pipe();
        pipe.atomic()
            .set(self.keys.job(&job.id), payload)
            .ignore()
            .cmd("ZADD")
            .arg(self.keys.jobs())
            .arg("NX")
            .arg(job.created_at)
            .arg(&member)
            .ignore();

        if job.awaits_dispatch() {
            pipe.zadd(self.keys.dispatch(), &member, job.next_dispatch_at)
                .ignore();
        } else {
            pipe.zrem(self.keys.dispatch(), &member).ignore();
        }

        pipe.query_async::<()>(&mut conn).await?;
        Ok(())
    }

    async fn get_job(&self, job_id: &JobId) -> Result<Option<JobRecord>, BrokerError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(self.keys.job(job_id)).await?;

        Ok(match raw {
            Some(raw) => Some(serde_json::from_str(&raw)?),
            None => None,
        })
    }

    async fn list_jobs(&self) -> Result<Vec<JobId>, BrokerError> {
        let mut conn = self.conn.clone();
        let ids: Vec<String> = conn.zrange(self.keys.jobs(), 0, -1).await?;
        Ok(ids.into_iter().map(JobId).collect())
    }

    async fn due_jobs(&self, now_ms: u64, limit: usize) -> Result<Vec<JobId>, BrokerError> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let mut conn = self.conn.clone();
        let ids: Vec<String> = conn
            .zrangebyscore_limit(self.keys.dispatch(), "-inf", now_ms, 0, list_index(limit))
            .await?;
        Ok(ids.into_iter().map(JobId).collect())
    }

    async fn mark_cancelled(&self, job_id: &JobId) -> Result<(), BrokerError> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.sadd(self.keys.cancelled(), job_id.to_string()).await?;
        Ok(())
    }

    async fn is_cancelled(&self, job_id: &JobId) -> Result<bool, BrokerError> {
        let mut conn = self.conn.clone();
        let cancelled: bool = conn
            .sismember(self.keys.cancelled(), job_id.to_string())
            .await?;
        Ok(cancelled)
    }

    async fn put_task_matches(
        &self,
        job_id: &JobId,
        task_id: TaskId,
        matches: &[MatchRecord],
    ) -> Result<(), BrokerError> {
        let list = self.keys.task_matches(job_id, task_id);
        let counts = self.keys.match_counts(job_id);

        let payloads = matches
            .iter()
            .map(serde_json::to_string)
            .collect::<Result<Vec<_>, _>>()?;

        let mut pipe = redis::pipe();
        pipe.atomic().del(&list).ignore();
        if payloads.is_empty() {
            pipe.hdel(&counts, task_id.0).ignore();
        } else {
            pipe.hset(&counts, task_id.0, payloads.len())
                .ignore()
                .rpush(&list, payloads)
                .ignore();
        }

        let mut conn = self.conn.clone();
        pipe.query_async::<()>(&mut conn).await?;
        Ok(())
    }

    async fn matches(
        &self,
        job_id: &JobId,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<MatchRecord>, BrokerError> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let mut conn = self.conn.clone();
        let counts: HashMap<u32, usize> = conn.hgetall(self.keys.match_counts(job_id)).await?;
        let mut counts: Vec<(TaskId, usize)> = counts
            .into_iter()
            .map(|(task_id, count)| (TaskId(task_id), count))
            .collect();
        counts.sort();

        let mut page = Vec::new();
        for (task_id, start, stop) in page_plan(&counts, offset, limit) {
            let raw: Vec<String> = conn
                .lrange(
                    self.keys.task_matches(job_id, task_id),
                    list_index(start),
                    list_index(stop),
                )
                .await?;
            for entry in raw {
                page.push(serde_json::from_str(&entry)?);
            }
        }

        Ok(page)
    }

    async fn enqueue(&self, task: &TaskRecord) -> Result<(), BrokerError> {
        let member = task.key.to_string();
        let task_key = self.keys.task(&task.key);

        let fields = [
            ("objects", serde_json::to_string(&task.objects)?),
            ("attempts", task.attempts.to_string()),
            ("state", task.state.as_str().to_string()),
            ("created_at", task.created_at.to_string()),
            ("updated_at", task.updated_at.to_string()),
        ];

        let mut conn = self.conn.clone();
        redis::pipe()
            .atomic()
            .del(&task_key)
            .ignore()
            .hset_multiple(&task_key, &fields[..])
            .ignore()
            .zadd(self.keys.tasks(&task.key.job_id), &member, task.key.task_id.0)
            .ignore()
            .rpush(self.keys.ready(), &member)
            .ignore()
            .query_async::<()>(&mut conn)
            .await?;

        tracing::trace!("Enqueued task {}", member);
        Ok(())
    }

    async fn lease(
        &self,
        worker: &WorkerId,
        lease_for: Duration,
        wait: Duration,
    ) -> Result<Option<TaskRecord>, BrokerError> {
        let deadline = Instant::now() + wait;

        loop {
            let now = now_ms();
            let lease_id = LeaseId::new();
            let mut conn = self.conn.clone();

            let member: Option<String> = self
                .scripts
                .lease
                .key(self.keys.ready())
                .key(self.keys.cancelled())
                .key(self.keys.leases())
                .arg(&self.keys.prefix)
                .arg(lease_id.to_string())
                .arg(worker.to_string())
                .arg(now + lease_for.as_millis() as u64)
                .arg(now)
                .invoke_async(&mut conn)
                .await?;

            if let Some(member) = member {
                let key = TaskKey::parse(&member).ok_or_else(|| BrokerError::Corrupt {
                    key: member.clone(),
                    reason: "malformed ready queue entry".to_string(),
                })?;

                tracing::debug!("Leased task {} to worker {}", key, worker);
                return self.load_task(&key).await;
            }

            if Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(POLL_INTERVAL.min(deadline.saturating_duration_since(Instant::now())))
                .await;
        }
    }

    async fn renew(
        &self,
        key: &TaskKey,
        lease_id: &LeaseId,
        lease_for: Duration,
    ) -> Result<bool, BrokerError> {
        let now = now_ms();
        let mut conn = self.conn.clone();

        let renewed: i32 = self
            .scripts
            .renew
            .key(self.keys.task(key))
            .key(self.keys.leases())
            .arg(lease_id.to_string())
            .arg(now + lease_for.as_millis() as u64)
            .arg(key.to_string())
            .arg(now)
            .invoke_async(&mut conn)
            .await?;

        Ok(renewed == 1)
    }

    async fn requeue(
        &self,
        key: &TaskKey,
        lease_id: &LeaseId,
    ) -> Result<Option<TaskRecord>, BrokerError> {
        let mut conn = self.conn.clone();

        let requeued: i32 = self
            .scripts
            .requeue
            .key(self.keys.task(key))
            .key(self.keys.ready())
            .key(self.keys.leases())
            .arg(lease_id.to_string())
            .arg(key.to_string())
            .arg(now_ms())
            .invoke_async(&mut conn)
            .await?;

        if requeued != 1 {
            return Ok(None);
        }

        let task = self.load_task(key).await?;
        if let Some(task) = &task {
            tracing::debug!("Requeued task {} (attempt {})", key, task.attempts);
        }
        Ok(task)
    }

    async fn settle(
        &self,
        key: &TaskKey,
        state: TaskState,
    ) -> Result<Option<TaskRecord>, BrokerError> {
        let mut conn = self.conn.clone();

        let settled: i32 = self
            .scripts
            .settle
            .key(self.keys.task(key))
            .key(self.keys.leases())
            .arg(state.as_str())
            .arg(key.to_string())
            .arg(now_ms())
            .invoke_async(&mut conn)
            .await?;

        if settled != 1 {
            return Ok(None);
        }
        self.load_task(key).await
    }

    async fn expired_leases(&self, now_ms: u64) -> Result<Vec<TaskRecord>, BrokerError> {
        let mut conn = self.conn.clone();
        let members: Vec<String> = conn
            .zrangebyscore(self.keys.leases(), "-inf", now_ms)
            .await?;

        let mut expired = Vec::with_capacity(members.len());
        for member in members {
            let Some(key) = TaskKey::parse(&member) else {
                tracing::warn!("Ignoring malformed lease entry '{}'", member);
                continue;
            };

            if let Some(task) = self.load_task(&key).await?
                && task.state == TaskState::Leased
                && task
                    .lease
                    .as_ref()
                    .is_some_and(|lease| lease.expires_at <= now_ms)
            {
                expired.push(task);
            }
        }

        Ok(expired)
    }

    async fn get_task(&self, key: &TaskKey) -> Result<Option<TaskRecord>, BrokerError> {
        self.load_task(key).await
    }

    async fn tasks_for_job(&self, job_id: &JobId) -> Result<Vec<TaskRecord>, BrokerError> {
        let mut conn = self.conn.clone();
        let members: Vec<String> = conn.zrange(self.keys.tasks(job_id), 0, -1).await?;

        let mut tasks = Vec::with_capacity(members.len());
        for member in members {
            let Some(key) = TaskKey::parse(&member) else {
                continue;
            };
            if let Some(task) = self.load_task(&key).await? {
                tasks.push(task);
            }
        }

        Ok(tasks)
    }

    async fn push_report(&self, report: &TaskReport) -> Result<(), BrokerError> {
        let payload = serde_json::to_string(report)?;
        let mut conn = self.conn.clone();
        let _: i64 = conn.rpush(self.keys.reports(), payload).await?;
        Ok(())
    }

    async fn next_report(&self, wait: Duration) -> Result<Option<TaskReport>, BrokerError> {
        let deadline = Instant::now() + wait;

        loop {
            let mut conn = self.conn.clone();
            let raw: Option<String> = conn.lpop(self.keys.reports(), None).await?;

            if let Some(raw) = raw {
                return Ok(Some(serde_json::from_str(&raw)?));
            }

            if Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(POLL_INTERVAL.min(deadline.saturating_duration_since(Instant::now())))
                .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> TaskKey {
        TaskKey::new(JobId("job-1".to_string()), TaskId(3))
    }

    fn fields(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_page_plan_spans_task_lists() {
        let counts = [(TaskId(0), 3), (TaskId(2), 0), (TaskId(5), 4)];

        assert_eq!(
            page_plan(&counts, 2, 3),
            vec![(TaskId(0), 2, 2), (TaskId(5), 0, 1)]
        );
        assert_eq!(page_plan(&counts, 3, 10), vec![(TaskId(5), 0, 3)]);
        assert!(page_plan(&counts, 7, 10).is_empty());
        assert!(page_plan(&counts, 0, 0).is_empty());
    }

    #[test]
    fn test_page_plan_handles_extreme_bounds() {
        let counts = [(TaskId(0), 3), (TaskId(1), 2)];

        assert!(page_plan(&counts, usize::MAX, 50).is_empty());
        assert!(page_plan(&counts, usize::MAX, usize::MAX).is_empty());
        assert_eq!(
            page_plan(&counts, 1, usize::MAX),
            vec![(TaskId(0), 1, 2), (TaskId(1), 0, 1)]
        );
        assert_eq!(list_index(usize::MAX), isize::MAX);
    }

    #[test]
    fn test_decode_empty_hash_is_missing_task() {
        let decoded = decode_task(&key(), HashMap::new()).unwrap();
        assert!(decoded.is_none());
    }

    #[test]
    fn test_decode_leased_task() {
        let raw = fields(&[
            ("objects", r#"["a.bin","b.bin"]"#),
            ("attempts", "2"),
            ("state", "leased"),
            ("lease_id", "lease-9"),
            ("worker", "worker-1"),
            ("expires_at", "1500"),
            ("created_at", "1000"),
            ("updated_at", "1200"),
        ]);

        let task = decode_task(&key(), raw).unwrap().unwrap();

        assert_eq!(task.key, key());
        assert_eq!(task.objects.len(), 2);
        assert_eq!(task.attempts, 2);
        assert_eq!(task.state, TaskState::Leased);
        let lease = task.lease.unwrap();
        assert_eq!(lease.lease_id, LeaseId("lease-9".to_string()));
        assert_eq!(lease.expires_at, 1500);
    }

    #[test]
    fn test_decode_pending_task_has_no_lease() {
        let raw = fields(&[
            ("objects", "[]"),
            ("attempts", "1"),
            ("state", "pending"),
            ("created_at", "1"),
            ("updated_at", "1"),
        ]);

        let task = decode_task(&key(), raw).unwrap().unwrap();
        assert!(task.lease.is_none());
        assert_eq!(task.state, TaskState::Pending);
    }

    #[test]
    fn test_decode_rejects_unknown_state() {
        let raw = fields(&[
            ("objects", "[]"),
            ("attempts", "1"),
            ("state", "exploded"),
            ("created_at", "1"),
            ("updated_at", "1"),
        ]);

        let result = decode_task(&key(), raw);
        assert!(matches!(result, Err(BrokerError::Corrupt { .. })));
    }
}
