//! 快照存储抽象层
//!
//! 只插入、不更新：同一会话每次保存都会新增一行。支持内存与 SQLite 两种实现。

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::RwLock;

use crate::core::{FusionError, FusionResult};
use crate::recovery::snapshot::{
    ContextSnapshot, DomainBlocks, RecoveryStatistics, SessionFilter, SessionSummary,
    SnapshotMetadata,
};

/// 快照存储接口
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// 插入一条快照
    async fn insert(&self, snapshot: &ContextSnapshot) -> FusionResult<()>;

    async fn get(&self, snapshot_id: &str) -> FusionResult<Option<ContextSnapshot>>;

    /// 会话最新的快照（时间相同时取后插入的）
    async fn latest_for_session(&self, session_id: &str) -> FusionResult<Option<ContextSnapshot>>;

    /// 会话摘要列表，最新在前
    async fn list_sessions(&self, filter: &SessionFilter) -> FusionResult<Vec<SessionSummary>>;

    /// 删除会话的全部快照，返回删除条数
    async fn delete_session(&self, session_id: &str) -> FusionResult<usize>;

    async fn statistics(&self) -> FusionResult<RecoveryStatistics>;
}

// ---------- 内存实现 ----------

/// 内存快照存储（进程退出即丢失）
#[derive(Default)]
pub struct MemorySnapshotStore {
    /// 按插入顺序
    snapshots: RwLock<Vec<ContextSnapshot>>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SnapshotStore for MemorySnapshotStore {
    async fn insert(&self, snapshot: &ContextSnapshot) -> FusionResult<()> {
        self.snapshots.write().await.push(snapshot.clone());
        Ok(())
    }

    async fn get(&self, snapshot_id: &str) -> FusionResult<Option<ContextSnapshot>> {
        Ok(self
            .snapshots
            .read()
            .await
            .iter()
            .find(|s| s.id == snapshot_id)
            .cloned())
    }

    async fn latest_for_session(&self, session_id: &str) -> FusionResult<Option<ContextSnapshot>> {
        Ok(self
            .snapshots
            .read()
            .await
            .iter()
            .enumerate()
            .filter(|(_, s)| s.session_id == session_id)
            .max_by_key(|(i, s)| (s.created_at, *i))
            .map(|(_, s)| s.clone()))
    }

    async fn list_sessions(&self, filter: &SessionFilter) -> FusionResult<Vec<SessionSummary>> {
        let snapshots = self.snapshots.read().await;

        // session_id -> (count, 最新快照的下标)
        let mut groups: Vec<(String, usize, usize)> = Vec::new();
        for (i, snap) in snapshots.iter().enumerate() {
            match groups.iter_mut().find(|(sid, _, _)| *sid == snap.session_id) {
                Some((_, count, latest)) => {
                    *count += 1;
                    if snap.created_at >= snapshots[*latest].created_at {
                        *latest = i;
                    }
                }
                None => groups.push((snap.session_id.clone(), 1, i)),
            }
        }

        let mut summaries: Vec<(usize, SessionSummary)> = groups
            .into_iter()
            .map(|(session_id, count, latest)| {
                let snap = &snapshots[latest];
                (
                    latest,
                    SessionSummary {
                        session_id,
                        snapshot_count: count,
                        latest_snapshot_id: snap.id.clone(),
                        latest_at: snap.created_at,
                        description: snap.metadata.description.clone(),
                    },
                )
            })
            .filter(|(_, s)| filter.since.map_or(true, |since| s.latest_at >= since))
            .collect();
        summaries.sort_by(|(ia, a), (ib, b)| b.latest_at.cmp(&a.latest_at).then(ib.cmp(ia)));

        let limit = filter.limit.unwrap_or(usize::MAX);
        Ok(summaries.into_iter().take(limit).map(|(_, s)| s).collect())
    }

    async fn delete_session(&self, session_id: &str) -> FusionResult<usize> {
        let mut snapshots = self.snapshots.write().await;
        let before = snapshots.len();
        snapshots.retain(|s| s.session_id != session_id);
        Ok(before - snapshots.len())
    }

    async fn statistics(&self) -> FusionResult<RecoveryStatistics> {
        let snapshots = self.snapshots.read().await;
        let mut sessions: Vec<&str> = snapshots.iter().map(|s| s.session_id.as_str()).collect();
        sessions.sort_unstable();
        sessions.dedup();
        Ok(RecoveryStatistics {
            total_snapshots: snapshots.len(),
            distinct_sessions: sessions.len(),
            oldest: snapshots.iter().map(|s| s.created_at).min(),
            newest: snapshots.iter().map(|s| s.created_at).max(),
        })
    }
}

// ---------- SQLite 实现 ----------

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS context_snapshots (
    id             TEXT PRIMARY KEY,
    session_id     TEXT NOT NULL,
    created_at     INTEGER NOT NULL,
    memory_block   TEXT,
    planning_block TEXT,
    agents_block   TEXT,
    tdd_block      TEXT,
    science_block  TEXT,
    metadata       TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_context_snapshots_session
    ON context_snapshots (session_id, created_at);
";

const SELECT_COLUMNS: &str = "id, session_id, created_at, memory_block, planning_block, \
     agents_block, tdd_block, science_block, metadata";

/// 读出的原始行；metadata 在锁外解析
struct SnapshotRow {
    id: String,
    session_id: String,
    created_at: i64,
    blocks: DomainBlocks,
    metadata: String,
}

impl SnapshotRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            session_id: row.get(1)?,
            created_at: row.get(2)?,
            blocks: DomainBlocks {
                memory: row.get(3)?,
                planning: row.get(4)?,
                agents: row.get(5)?,
                tdd: row.get(6)?,
                science: row.get(7)?,
            },
            metadata: row.get(8)?,
        })
    }

    fn into_snapshot(self) -> FusionResult<ContextSnapshot> {
        let metadata: SnapshotMetadata = serde_json::from_str(&self.metadata).map_err(|e| {
            FusionError::DataIntegrity(format!("snapshot {} has unreadable metadata: {e}", self.id))
        })?;
        Ok(ContextSnapshot {
            created_at: millis_to_datetime(self.created_at)?,
            id: self.id,
            session_id: self.session_id,
            blocks: self.blocks,
            metadata,
        })
    }
}

fn millis_to_datetime(millis: i64) -> FusionResult<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_millis(millis)
        .ok_or_else(|| FusionError::DataIntegrity(format!("timestamp out of range: {millis}")))
}

/// SQLite 快照存储
///
/// rusqlite 是同步接口：连接放在 `std::sync::Mutex` 里，所有访问都在 `spawn_blocking` 中执行。
pub struct SqliteSnapshotStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteSnapshotStore {
    /// 打开（或创建）数据库文件；父目录不存在时自动创建
    pub fn open(path: impl AsRef<Path>) -> FusionResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|e| FusionError::Storage(format!("create {}: {e}", parent.display())))?;
        }
        Self::init(Connection::open(path)?)
    }

    pub fn open_in_memory() -> FusionResult<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> FusionResult<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> FusionResult<T>
    where
        F: FnOnce(&Connection) -> FusionResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = conn
                .lock()
                .map_err(|_| FusionError::Storage("snapshot store connection poisoned".to_string()))?;
            f(&*guard)
        })
        .await?
    }
}

#[async_trait]
impl SnapshotStore for SqliteSnapshotStore {
    async fn insert(&self, snapshot: &ContextSnapshot) -> FusionResult<()> {
        let metadata = serde_json::to_string(&snapshot.metadata)?;
        let snap = snapshot.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO context_snapshots (id, session_id, created_at, memory_block, \
                 planning_block, agents_block, tdd_block, science_block, metadata) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    snap.id,
                    snap.session_id,
                    snap.created_at.timestamp_millis(),
                    snap.blocks.memory,
                    snap.blocks.planning,
                    snap.blocks.agents,
                    snap.blocks.tdd,
                    snap.blocks.science,
                    metadata,
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn get(&self, snapshot_id: &str) -> FusionResult<Option<ContextSnapshot>> {
        let snapshot_id = snapshot_id.to_string();
        let row = self
            .with_conn(move |conn| {
                let sql = format!("SELECT {SELECT_COLUMNS} FROM context_snapshots WHERE id = ?1");
                Ok(conn
                    .query_row(&sql, params![snapshot_id], SnapshotRow::from_row)
                    .optional()?)
            })
            .await?;
        row.map(SnapshotRow::into_snapshot).transpose()
    }

    async fn latest_for_session(&self, session_id: &str) -> FusionResult<Option<ContextSnapshot>> {
        let session_id = session_id.to_string();
        let row = self
            .with_conn(move |conn| {
                let sql = format!(
                    "SELECT {SELECT_COLUMNS} FROM context_snapshots WHERE session_id = ?1 \
                     ORDER BY created_at DESC, rowid DESC LIMIT 1"
                );
                Ok(conn
                    .query_row(&sql, params![session_id], SnapshotRow::from_row)
                    .optional()?)
            })
            .await?;
        row.map(SnapshotRow::into_snapshot).transpose()
    }

    async fn list_sessions(&self, filter: &SessionFilter) -> FusionResult<Vec<SessionSummary>> {
        let since = filter.since.map_or(i64::MIN, |t| t.timestamp_millis());
        // SQLite 中 LIMIT -1 表示不限
        let limit = filter.limit.map_or(-1, |l| l.min(i64::MAX as usize) as i64);

        let rows = self
            .with_conn(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT session_id, COUNT(*) AS n, MAX(created_at) AS latest \
                     FROM context_snapshots GROUP BY session_id \
                     HAVING latest >= ?1 ORDER BY latest DESC LIMIT ?2",
                )?;
                let groups = stmt
                    .query_map(params![since, limit], |row| {
                        Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
                    })?
                    .collect::<Result<Vec<_>, _>>()?;

                let mut latest_stmt = conn.prepare(
                    "SELECT id, created_at, metadata FROM context_snapshots WHERE session_id = ?1 \
                     ORDER BY created_at DESC, rowid DESC LIMIT 1",
                )?;
                let mut rows = Vec::with_capacity(groups.len());
                for (session_id, count) in groups {
                    let (id, created_at, metadata) = latest_stmt.query_row(params![session_id], |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, i64>(1)?,
                            row.get::<_, String>(2)?,
                        ))
                    })?;
                    rows.push((session_id, count, id, created_at, metadata));
                }
                Ok(rows)
            })
            .await?;

        rows.into_iter()
            .map(|(session_id, count, id, created_at, metadata)| {
                let description = serde_json::from_str::<SnapshotMetadata>(&metadata)
                    .ok()
                    .and_then(|m| m.description);
                Ok(SessionSummary {
                    session_id,
                    snapshot_count: count.max(0) as usize,
                    latest_snapshot_id: id,
                    latest_at: millis_to_datetime(created_at)?,
                    description,
                })
            })
            .collect()
    }

    async fn delete_session(&self, session_id: &str) -> FusionResult<usize> {
        let session_id = session_id.to_string();
        self.with_conn(move |conn| {
            Ok(conn.execute(
                "DELETE FROM context_snapshots WHERE session_id = ?1",
                params![session_id],
            )?)
        })
        .await
    }

    async fn statistics(&self) -> FusionResult<RecoveryStatistics> {
        let (total, sessions, oldest, newest) = self
            .with_conn(|conn| {
                Ok(conn.query_row(
                    "SELECT COUNT(*), COUNT(DISTINCT session_id), MIN(created_at), MAX(created_at) \
                     FROM context_snapshots",
                    [],
                    |row| {
                        Ok((
                            row.get::<_, i64>(0)?,
                            row.get::<_, i64>(1)?,
                            row.get::<_, Option<i64>>(2)?,
                            row.get::<_, Option<i64>>(3)?,
                        ))
                    },
                )?)
            })
            .await?;

        Ok(RecoveryStatistics {
            total_snapshots: total.max(0) as usize,
            distinct_sessions: sessions.max(0) as usize,
            oldest: oldest.map(millis_to_datetime).transpose()?,
            newest: newest.map(millis_to_datetime).transpose()?,
        })
    }
}

/// 创建快照存储
///
/// 提供 db_path 时使用 SQLite；打开失败或未提供时使用内存存储
pub fn create_snapshot_store(db_path: Option<&Path>) -> Arc<dyn SnapshotStore> {
    if let Some(path) = db_path {
        match SqliteSnapshotStore::open(path) {
            Ok(store) => {
                tracing::info!("Using SQLite snapshot store: {:?}", path);
                return Arc::new(store);
            }
            Err(e) => {
                tracing::warn!("Failed to open snapshot database, falling back to memory: {}", e);
            }
        }
    }

    tracing::info!("Using in-memory snapshot store");
    Arc::new(MemorySnapshotStore::new())
}
