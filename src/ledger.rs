//! Performance ledger: running per-model statistics that feed selection
//! scores, with an optional relational persistence hook.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex, RwLock};

use crate::error::{Error, ErrorKind, Result};
use crate::provider::types::{ProviderId, TaskKind};

/// Running statistics for one model. All counters are monotone within the
/// record's lifetime; the mean response time covers successful calls only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceRecord {
    pub model_id: String,
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    /// Mean response time of successful calls, in seconds
    pub avg_response_time: f64,
    pub error_rate: f64,
    pub last_used: Option<DateTime<Utc>>,
}

impl PerformanceRecord {
    fn new(model_id: impl Into<String>) -> Self {
        Self {
            model_id: model_id.into(),
            total_requests: 0,
            successful_requests: 0,
            failed_requests: 0,
            avg_response_time: 0.0,
            error_rate: 0.0,
            last_used: None,
        }
    }

    pub fn success_rate(&self) -> f64 {
        if self.total_requests == 0 {
            1.0
        } else {
            self.successful_requests as f64 / self.total_requests as f64
        }
    }

    pub fn avg_latency_ms(&self) -> f64 {
        self.avg_response_time * 1000.0
    }

    fn apply(&mut self, event: &PerformanceEvent) {
        self.total_requests += 1;
        self.last_used = Some(event.timestamp);

        if event.success {
            self.successful_requests += 1;
            let n = self.successful_requests as f64;
            self.avg_response_time =
                ((self.avg_response_time * (n - 1.0)) + event.latency_secs) / n;
        } else {
            self.failed_requests += 1;
        }

        self.error_rate = self.failed_requests as f64 / self.total_requests as f64;
    }
}

/// One completed call, success or failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceEvent {
    pub model_id: String,
    pub provider: ProviderId,
    pub task: TaskKind,
    pub user_id: Option<String>,
    pub success: bool,
    pub latency_secs: f64,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub cost: f64,
    pub error: Option<ErrorKind>,
    pub timestamp: DateTime<Utc>,
}

impl PerformanceEvent {
    pub fn success(
        model_id: impl Into<String>,
        provider: ProviderId,
        task: TaskKind,
        latency_secs: f64,
    ) -> Self {
        Self {
            model_id: model_id.into(),
            provider,
            task,
            user_id: None,
            success: true,
            latency_secs,
            prompt_tokens: 0,
            completion_tokens: 0,
            cost: 0.0,
            error: None,
            timestamp: Utc::now(),
        }
    }

    pub fn failure(
        model_id: impl Into<String>,
        provider: ProviderId,
        task: TaskKind,
        latency_secs: f64,
        error: ErrorKind,
    ) -> Self {
        Self {
            model_id: model_id.into(),
            provider,
            task,
            user_id: None,
            success: false,
            latency_secs,
            prompt_tokens: 0,
            completion_tokens: 0,
            cost: 0.0,
            error: Some(error),
            timestamp: Utc::now(),
        }
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_tokens(mut self, prompt: u32, completion: u32) -> Self {
        self.prompt_tokens = prompt;
        self.completion_tokens = completion;
        self
    }

    pub fn with_cost(mut self, cost: f64) -> Self {
        self.cost = cost;
        self
    }
}

/// Durable sink for ledger events. The ledger works identically with no
/// store attached.
pub trait LedgerStore: Send + Sync {
    fn persist_event(&self, event: &PerformanceEvent) -> Result<()>;
}

/// In-memory running statistics per model.
///
/// Records for distinct models update independently; updates to the same
/// model serialize on that model's mutex, held only for the arithmetic.
pub struct PerformanceLedger {
    records: RwLock<HashMap<String, Arc<Mutex<PerformanceRecord>>>>,
    events: Mutex<VecDeque<PerformanceEvent>>,
    max_events: usize,
    store: Option<Arc<dyn LedgerStore>>,
}

impl PerformanceLedger {
    pub fn new(max_events: usize) -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            events: Mutex::new(VecDeque::new()),
            max_events: max_events.max(1),
            store: None,
        }
    }

    pub fn with_store(mut self, store: Arc<dyn LedgerStore>) -> Self {
        self.store = Some(store);
        self
    }

    fn record_handle(&self, model_id: &str) -> Arc<Mutex<PerformanceRecord>> {
        if let Some(handle) = self
            .records
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(model_id)
        {
            return Arc::clone(handle);
        }
        let mut records = self.records.write().unwrap_or_else(|e| e.into_inner());
        Arc::clone(
            records
                .entry(model_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(PerformanceRecord::new(model_id)))),
        )
    }

    /// Record one completed call, success or failure.
    pub fn record(&self, event: PerformanceEvent) {
        let handle = self.record_handle(&event.model_id);
        {
            let mut record = handle.lock().unwrap_or_else(|e| e.into_inner());
            record.apply(&event);
        }

        if let Some(store) = &self.store {
            if let Err(e) = store.persist_event(&event) {
                tracing::warn!(model = %event.model_id, error = %e, "ledger persistence failed");
            }
        }

        let mut events = self.events.lock().unwrap_or_else(|e| e.into_inner());
        if events.len() == self.max_events {
            events.pop_front();
        }
        events.push_back(event);
    }

    /// Current statistics for one model, if it has been used.
    pub fn snapshot(&self, model_id: &str) -> Option<PerformanceRecord> {
        self.records
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(model_id)
            .map(|handle| handle.lock().unwrap_or_else(|e| e.into_inner()).clone())
    }

    /// Statistics for every model seen so far.
    pub fn snapshot_all(&self) -> Vec<PerformanceRecord> {
        let records = self.records.read().unwrap_or_else(|e| e.into_inner());
        let mut all: Vec<PerformanceRecord> = records
            .values()
            .map(|handle| handle.lock().unwrap_or_else(|e| e.into_inner()).clone())
            .collect();
        all.sort_by(|a, b| a.model_id.cmp(&b.model_id));
        all
    }

    /// Recent events, oldest first, bounded by the configured cap.
    pub fn recent_events(&self) -> Vec<PerformanceEvent> {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect()
    }
}

/// SQLite-backed ledger store writing the `usage_logs` and
/// `task_performance` tables.
pub struct SqliteLedgerStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteLedgerStore {
    /// Open or create a store at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path).map_err(|e| Error::Storage(e.to_string()))?;
        Self::initialize_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Create an in-memory store (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|e| Error::Storage(e.to_string()))?;
        Self::initialize_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn initialize_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS providers (
                 id TEXT PRIMARY KEY,
                 type TEXT NOT NULL,
                 name TEXT NOT NULL,
                 base_url TEXT,
                 enabled INTEGER NOT NULL DEFAULT 1,
                 priority INTEGER NOT NULL DEFAULT 0,
                 metadata TEXT
             );
             CREATE TABLE IF NOT EXISTS models (
                 id TEXT PRIMARY KEY,
                 provider_id TEXT,
                 capabilities TEXT,
                 context_length INTEGER,
                 cost_prompt REAL,
                 cost_completion REAL,
                 enabled INTEGER NOT NULL DEFAULT 1,
                 reliability REAL,
                 avg_latency REAL,
                 metadata TEXT
             );
             CREATE TABLE IF NOT EXISTS usage_logs (
                 id INTEGER PRIMARY KEY AUTOINCREMENT,
                 user_id TEXT,
                 provider_id TEXT NOT NULL,
                 model_id TEXT NOT NULL,
                 prompt_tokens INTEGER NOT NULL,
                 completion_tokens INTEGER NOT NULL,
                 cost REAL NOT NULL,
                 latency_ms INTEGER NOT NULL,
                 success INTEGER NOT NULL,
                 error TEXT,
                 task_type_id TEXT,
                 created_at TEXT NOT NULL
             );
             CREATE TABLE IF NOT EXISTS task_performance (
                 id INTEGER PRIMARY KEY AUTOINCREMENT,
                 task_type_id TEXT NOT NULL,
                 model_id TEXT NOT NULL,
                 success_rate REAL NOT NULL,
                 avg_latency REAL NOT NULL,
                 avg_cost REAL NOT NULL,
                 sample_size INTEGER NOT NULL,
                 last_success_at TEXT,
                 UNIQUE(task_type_id, model_id)
             );",
        )
        .map_err(|e| Error::Storage(e.to_string()))
    }

    fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<T>,
    {
        let conn = self
            .conn
            .lock()
            .map_err(|e| Error::internal(format!("failed to lock connection: {}", e)))?;
        f(&conn).map_err(|e| Error::Storage(e.to_string()))
    }

    /// Rolled-up per-task stats for one model, if any samples exist.
    pub fn task_performance(
        &self,
        task: TaskKind,
        model_id: &str,
    ) -> Result<Option<(f64, f64, u64)>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT success_rate, avg_latency, sample_size
                 FROM task_performance WHERE task_type_id = ?1 AND model_id = ?2",
                params![task.as_str(), model_id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get::<_, i64>(2)? as u64)),
            )
            .optional()
        })
    }

    pub fn usage_log_count(&self) -> Result<u64> {
        self.with_conn(|conn| {
            conn.query_row("SELECT COUNT(*) FROM usage_logs", [], |row| {
                row.get::<_, i64>(0).map(|n| n as u64)
            })
        })
    }
}

impl LedgerStore for SqliteLedgerStore {
    fn persist_event(&self, event: &PerformanceEvent) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO usage_logs (
                     user_id, provider_id, model_id, prompt_tokens, completion_tokens,
                     cost, latency_ms, success, error, task_type_id, created_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    event.user_id,
                    event.provider.as_str(),
                    event.model_id,
                    event.prompt_tokens as i64,
                    event.completion_tokens as i64,
                    event.cost,
                    (event.latency_secs * 1000.0) as i64,
                    event.success as i64,
                    event.error.map(|k| k.to_string()),
                    event.task.as_str(),
                    event.timestamp.to_rfc3339(),
                ],
            )?;

            let existing: Option<(f64, f64, f64, i64)> = conn
                .query_row(
                    "SELECT success_rate, avg_latency, avg_cost, sample_size
                     FROM task_performance WHERE task_type_id = ?1 AND model_id = ?2",
                    params![event.task.as_str(), event.model_id],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
                )
                .optional()?;

            let success = if event.success { 1.0 } else { 0.0 };
            let latency_ms = event.latency_secs * 1000.0;
            let last_success = event.success.then(|| event.timestamp.to_rfc3339());

            match existing {
                Some((rate, avg_latency, avg_cost, n)) => {
                    let n_new = n + 1;
                    let rate_new = (rate * n as f64 + success) / n_new as f64;
                    let latency_new = (avg_latency * n as f64 + latency_ms) / n_new as f64;
                    let cost_new = (avg_cost * n as f64 + event.cost) / n_new as f64;
                    conn.execute(
                        "UPDATE task_performance
                         SET success_rate = ?1, avg_latency = ?2, avg_cost = ?3,
                             sample_size = ?4,
                             last_success_at = COALESCE(?5, last_success_at)
                         WHERE task_type_id = ?6 AND model_id = ?7",
                        params![
                            rate_new,
                            latency_new,
                            cost_new,
                            n_new,
                            last_success,
                            event.task.as_str(),
                            event.model_id,
                        ],
                    )?;
                }
                None => {
                    conn.execute(
                        "INSERT INTO task_performance (
                             task_type_id, model_id, success_rate, avg_latency,
                             avg_cost, sample_size, last_success_at
                         ) VALUES (?1, ?2, ?3, ?4, ?5, 1, ?6)",
                        params![
                            event.task.as_str(),
                            event.model_id,
                            success,
                            latency_ms,
                            event.cost,
                            last_success,
                        ],
                    )?;
                }
            }
            Ok(())
        })
    }
}
