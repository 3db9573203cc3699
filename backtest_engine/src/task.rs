/// task.rs — Backtesting task objects, their Redis store, and the per-task
/// progress/control channel
///
/// Tasks live under `{prefix}:obj:{id}` with a unique secondary index
/// `{prefix}:index:{file_name} -> id` and a monotonic id counter at
/// `{prefix}:next_id`. Progress messages and lifecycle events are published
/// on the `{prefix}:messages:{id}` pub/sub channel.
use anyhow::{anyhow, bail, Context, Result};
use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::debug;

/// Configuration for one backtest run. Field names on the wire follow the
/// external JSON contract (camelCase runtime flags).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestingTask {
    pub id: u64,
    /// Strategy file name; unique secondary key in the store.
    pub file_name: String,
    #[serde(default)]
    pub name: String,
    /// Fresh GUID stamped on every start; duplicate-worker witness.
    #[serde(default)]
    pub result_id: String,

    // ── Market ───────────────────────────────────────────────────────
    pub source: String,
    pub symbol: String,
    pub timeframe: String,
    #[serde(rename = "dateStart")]
    pub date_start: String,
    #[serde(rename = "dateEnd")]
    pub date_end: String,

    // ── Simulation parameters ────────────────────────────────────────
    #[serde(default)]
    pub fee_taker: f64,
    #[serde(default)]
    pub fee_maker: f64,
    #[serde(default)]
    pub price_step: f64,
    pub precision_amount: f64,
    pub precision_price: f64,
    #[serde(default)]
    pub slippage_in_steps: f64,

    // ── Runtime ──────────────────────────────────────────────────────
    #[serde(rename = "isRunning", default)]
    pub is_running: bool,
    #[serde(default)]
    pub parameters: Map<String, Value>,
}

impl BacktestingTask {
    pub fn new(id: u64) -> Self {
        let now = Utc::now();
        Self {
            id,
            file_name: String::new(),
            name: String::new(),
            result_id: String::new(),
            source: String::new(),
            symbol: String::new(),
            timeframe: String::new(),
            date_start: (now - Duration::days(30)).format("%Y-%m-%dT%H:%M:%S").to_string(),
            date_end: (now - Duration::days(1)).format("%Y-%m-%dT%H:%M:%S").to_string(),
            fee_taker: 0.0,
            fee_maker: 0.0,
            price_step: 0.0,
            precision_amount: 0.001,
            precision_price: 0.01,
            slippage_in_steps: 0.0,
            is_running: false,
            parameters: Map::new(),
        }
    }

    /// Secondary key for the unique store index.
    pub fn key(&self) -> &str {
        &self.file_name
    }

    /// Display name, derived from the strategy and market when unset.
    pub fn display_name(&self) -> String {
        if self.name.is_empty() {
            format!(
                "{} ({}:{} {})",
                self.file_name, self.source, self.symbol, self.timeframe
            )
        } else {
            self.name.clone()
        }
    }
}

// ── Progress/control envelopes ────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageLevel {
    Info,
    Warning,
    Error,
    Success,
    Debug,
}

/// Lifecycle events carried on the control channel.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TaskEvent {
    BacktestingStarted {
        result_id: String,
    },
    BacktestingProgress {
        result_id: String,
        progress: f64,
        date_start: String,
        current_time: String,
    },
    BacktestingCompleted {
        result_id: String,
    },
    BacktestingError {
        result_id: String,
        message: String,
    },
}

/// The two envelope kinds on `{prefix}:messages:{id}`.
#[derive(Debug, Clone)]
pub enum Envelope {
    Message { level: MessageLevel, message: String },
    Event(TaskEvent),
}

impl Envelope {
    fn to_json(&self) -> Result<Value> {
        let timestamp = Utc::now().to_rfc3339();
        Ok(match self {
            Envelope::Message { level, message } => json!({
                "timestamp": timestamp,
                "level": level,
                "message": message,
            }),
            Envelope::Event(event) => json!({
                "timestamp": timestamp,
                "type": "event",
                "data": serde_json::to_value(event)?,
            }),
        })
    }
}

// ── Store ─────────────────────────────────────────────────────────────────

pub struct TaskStore {
    redis: redis::Client,
    prefix: String,
}

impl TaskStore {
    pub fn new(redis_url: &str, prefix: &str) -> Result<Self> {
        Ok(Self {
            redis: redis::Client::open(redis_url).context("task store redis client")?,
            prefix: prefix.to_owned(),
        })
    }

    fn obj_key(&self, id: u64) -> String {
        format!("{}:obj:{}", self.prefix, id)
    }

    fn index_key(&self, key: &str) -> String {
        format!("{}:index:{}", self.prefix, key)
    }

    fn next_id_key(&self) -> String {
        format!("{}:next_id", self.prefix)
    }

    fn messages_channel(&self, id: u64) -> String {
        format!("{}:messages:{}", self.prefix, id)
    }

    fn conn(&self) -> Result<redis::Connection> {
        Ok(self.redis.get_connection()?)
    }

    /// Allocate a fresh id and return an in-memory task. Nothing is indexed
    /// until the first `save`.
    pub fn new_task(&self) -> Result<BacktestingTask> {
        let mut conn = self.conn()?;
        let id: u64 = redis::cmd("INCR")
            .arg(self.next_id_key())
            .query(&mut conn)?;
        debug!("Allocated task id {id}");
        Ok(BacktestingTask::new(id))
    }

    /// Persist the task, maintaining the unique `file_name` index. Saving a
    /// key that already points at a different id is an error; changing a
    /// task's key removes the stale index entry in the same round trip.
    pub fn save(&self, task: &BacktestingTask) -> Result<()> {
        let mut conn = self.conn()?;
        let new_key = task.key().to_owned();
        let old_key = self
            .load(task.id)?
            .map(|previous| previous.key().to_owned())
            .filter(|k| !k.is_empty());

        if !new_key.is_empty() {
            if old_key.as_deref() != Some(new_key.as_str()) {
                let existing: Option<String> = redis::cmd("GET")
                    .arg(self.index_key(&new_key))
                    .query(&mut conn)?;
                if let Some(existing_id) = existing {
                    if existing_id != task.id.to_string() {
                        bail!(
                            "key '{new_key}' already exists for task {existing_id}"
                        );
                    }
                }
            }
        }

        let payload = serde_json::to_string(task)?;
        let mut pipe = redis::pipe();
        pipe.atomic();
        if let Some(old) = old_key {
            if old != new_key {
                pipe.cmd("DEL").arg(self.index_key(&old)).ignore();
            }
        }
        pipe.cmd("SET").arg(self.obj_key(task.id)).arg(payload).ignore();
        if !new_key.is_empty() {
            pipe.cmd("SET")
                .arg(self.index_key(&new_key))
                .arg(task.id)
                .ignore();
        }
        pipe.query::<()>(&mut conn)?;
        debug!("Saved task {} under key '{}'", task.id, new_key);
        Ok(())
    }

    pub fn load(&self, id: u64) -> Result<Option<BacktestingTask>> {
        let mut conn = self.conn()?;
        let payload: Option<String> = redis::cmd("GET")
            .arg(self.obj_key(id))
            .query(&mut conn)?;
        match payload {
            Some(json) => Ok(Some(
                serde_json::from_str(&json).with_context(|| format!("decode task {id}"))?,
            )),
            None => Ok(None),
        }
    }

    pub fn load_by_key(&self, key: &str) -> Result<Option<BacktestingTask>> {
        let mut conn = self.conn()?;
        let id: Option<String> = redis::cmd("GET")
            .arg(self.index_key(key))
            .query(&mut conn)?;
        match id {
            Some(id) => self.load(id.parse()?),
            None => Ok(None),
        }
    }

    pub fn list(&self) -> Result<Vec<BacktestingTask>> {
        let mut conn = self.conn()?;
        let keys: Vec<String> = redis::cmd("KEYS")
            .arg(format!("{}:obj:*", self.prefix))
            .query(&mut conn)?;

        let mut tasks = Vec::with_capacity(keys.len());
        for key in keys {
            let payload: Option<String> = redis::cmd("GET").arg(&key).query(&mut conn)?;
            if let Some(json) = payload {
                match serde_json::from_str(&json) {
                    Ok(task) => tasks.push(task),
                    Err(e) => tracing::error!("Failed to decode task at {key}: {e}"),
                }
            }
        }
        Ok(tasks)
    }

    pub fn delete(&self, id: u64) -> Result<()> {
        let task = self
            .load(id)?
            .ok_or_else(|| anyhow!("task {id} not found"))?;
        let mut conn = self.conn()?;
        let mut pipe = redis::pipe();
        pipe.atomic();
        if !task.key().is_empty() {
            pipe.cmd("DEL").arg(self.index_key(task.key())).ignore();
        }
        pipe.cmd("DEL").arg(self.obj_key(id)).ignore();
        pipe.query::<()>(&mut conn)?;
        Ok(())
    }

    /// Publish a MESSAGE or EVENT envelope on the task's pub/sub channel.
    pub fn send_envelope(&self, id: u64, envelope: &Envelope) -> Result<()> {
        let channel = self.messages_channel(id);
        let payload = serde_json::to_string(&envelope.to_json()?)?;
        let mut conn = self.conn()?;
        let subscribers: u64 = redis::cmd("PUBLISH")
            .arg(&channel)
            .arg(payload)
            .query(&mut conn)?;
        debug!("Published envelope to {channel} ({subscribers} subscribers)");
        Ok(())
    }

    pub fn send_message(&self, id: u64, level: MessageLevel, message: &str) -> Result<()> {
        self.send_envelope(
            id,
            &Envelope::Message {
                level,
                message: message.to_owned(),
            },
        )
    }

    pub fn send_event(&self, id: u64, event: TaskEvent) -> Result<()> {
        self.send_envelope(id, &Envelope::Event(event))
    }
}
