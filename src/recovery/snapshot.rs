//! 快照数据模型
//!
//! - [`ContextState`]：capture 得到的内存形态
//! - [`ContextSnapshot`]：save 之后的持久化形态，每个领域一个独立序列化的区块
//!
//! Agent 执行记录与测试记录只保留引用字段，恢复时不会重建。

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};

use crate::collaborators::{AgentExecution, ExecutionStatus, MemoryEntry, TaskRecord, TestRun, TestRunStatus};

/// 快照领域
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotDomain {
    Memory,
    Planning,
    Agents,
    Tdd,
    /// 分析会话属于临时数据，列保留但从不写入
    Science,
}

impl SnapshotDomain {
    pub const ALL: [SnapshotDomain; 5] = [
        SnapshotDomain::Memory,
        SnapshotDomain::Planning,
        SnapshotDomain::Agents,
        SnapshotDomain::Tdd,
        SnapshotDomain::Science,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SnapshotDomain::Memory => "memory",
            SnapshotDomain::Planning => "planning",
            SnapshotDomain::Agents => "agents",
            SnapshotDomain::Tdd => "tdd",
            SnapshotDomain::Science => "science",
        }
    }

    /// 恢复时会重建实体的领域
    pub fn is_restorable(&self) -> bool {
        matches!(self, SnapshotDomain::Memory | SnapshotDomain::Planning)
    }
}

impl fmt::Display for SnapshotDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Agent 执行的引用字段（不含 result）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentExecutionRef {
    pub id: String,
    pub agent_type: String,
    pub status: ExecutionStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl From<&AgentExecution> for AgentExecutionRef {
    fn from(e: &AgentExecution) -> Self {
        Self {
            id: e.id.clone(),
            agent_type: e.agent_type.clone(),
            status: e.status,
            started_at: e.started_at,
            completed_at: e.completed_at,
        }
    }
}

/// 测试运行的引用字段（不含 output）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestRunRef {
    pub test_path: String,
    pub status: TestRunStatus,
    pub runner: String,
    pub duration_ms: u64,
}

impl From<&TestRun> for TestRunRef {
    fn from(r: &TestRun) -> Self {
        Self {
            test_path: r.test_path.clone(),
            status: r.status,
            runner: r.runner.clone(),
            duration_ms: r.duration_ms,
        }
    }
}

/// capture 的结果（内存形态）
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContextState {
    pub captured_at: Option<DateTime<Utc>>,
    pub memory: Vec<MemoryEntry>,
    pub tasks: Vec<TaskRecord>,
    pub agents: Vec<AgentExecutionRef>,
    pub test_runs: Vec<TestRunRef>,
    /// 读取失败的领域及原因；对应领域的列表为空
    pub capture_errors: BTreeMap<SnapshotDomain, String>,
}

impl ContextState {
    pub fn count(&self, domain: SnapshotDomain) -> usize {
        match domain {
            SnapshotDomain::Memory => self.memory.len(),
            SnapshotDomain::Planning => self.tasks.len(),
            SnapshotDomain::Agents => self.agents.len(),
            SnapshotDomain::Tdd => self.test_runs.len(),
            SnapshotDomain::Science => 0,
        }
    }
}

/// 检查点类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CheckpointKind {
    #[default]
    Manual,
    SessionEnd,
    /// 上下文压缩前的检查点
    ContextFull,
}

/// 快照元数据
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    pub user: Option<String>,
    pub project: Option<String>,
    pub description: Option<String>,
    #[serde(default)]
    pub checkpoint: CheckpointKind,
    /// 至少一个领域未能写入
    #[serde(default)]
    pub partial: bool,
    #[serde(default)]
    pub domain_errors: BTreeMap<SnapshotDomain, String>,
    #[serde(default)]
    pub counts: BTreeMap<SnapshotDomain, usize>,
}

impl SnapshotMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    pub fn with_project(mut self, project: impl Into<String>) -> Self {
        self.project = Some(project.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_checkpoint(mut self, checkpoint: CheckpointKind) -> Self {
        self.checkpoint = checkpoint;
        self
    }
}

/// 每个领域一个序列化区块（JSON 文本）；None 表示未写入
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DomainBlocks {
    pub memory: Option<String>,
    pub planning: Option<String>,
    pub agents: Option<String>,
    pub tdd: Option<String>,
    pub science: Option<String>,
}

impl DomainBlocks {
    pub fn get(&self, domain: SnapshotDomain) -> Option<&str> {
        match domain {
            SnapshotDomain::Memory => self.memory.as_deref(),
            SnapshotDomain::Planning => self.planning.as_deref(),
            SnapshotDomain::Agents => self.agents.as_deref(),
            SnapshotDomain::Tdd => self.tdd.as_deref(),
            SnapshotDomain::Science => self.science.as_deref(),
        }
    }

    pub fn set(&mut self, domain: SnapshotDomain, block: Option<String>) {
        let slot = match domain {
            SnapshotDomain::Memory => &mut self.memory,
            SnapshotDomain::Planning => &mut self.planning,
            SnapshotDomain::Agents => &mut self.agents,
            SnapshotDomain::Tdd => &mut self.tdd,
            SnapshotDomain::Science => &mut self.science,
        };
        *slot = block;
    }
}

/// 持久化的快照（保存后不可变）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextSnapshot {
    pub id: String,
    pub session_id: String,
    pub created_at: DateTime<Utc>,
    pub blocks: DomainBlocks,
    pub metadata: SnapshotMetadata,
}

impl ContextSnapshot {
    pub fn new(session_id: impl Into<String>, blocks: DomainBlocks, metadata: SnapshotMetadata) -> Self {
        Self {
            id: format!("snap_{}", uuid::Uuid::new_v4()),
            session_id: session_id.into(),
            // 存储层以毫秒保存时间戳
            created_at: Utc::now().trunc_subsecs(3),
            blocks,
            metadata,
        }
    }
}

/// 会话摘要（列表用，最新在前）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub snapshot_count: usize,
    pub latest_snapshot_id: String,
    pub latest_at: DateTime<Utc>,
    /// 最新快照的描述
    pub description: Option<String>,
}

/// 会话列表过滤条件
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionFilter {
    /// 只返回最新快照晚于该时间的会话
    pub since: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

impl SessionFilter {
    pub fn since(mut self, since: DateTime<Utc>) -> Self {
        self.since = Some(since);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecoveryStatistics {
    pub total_snapshots: usize,
    pub distinct_sessions: usize,
    pub oldest: Option<DateTime<Utc>>,
    pub newest: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_memory_and_planning_restore() {
        let restorable: Vec<_> = SnapshotDomain::ALL
            .iter()
            .filter(|d| d.is_restorable())
            .collect();
        assert_eq!(restorable, vec![&SnapshotDomain::Memory, &SnapshotDomain::Planning]);
    }

    #[test]
    fn test_metadata_serializes_checkpoint_kebab_case() {
        let meta = SnapshotMetadata::new()
            .with_project("fusion")
            .with_checkpoint(CheckpointKind::ContextFull);
        let value = serde_json::to_value(&meta).unwrap();
        assert_eq!(value["checkpoint"], "context-full");
        assert_eq!(value["project"], "fusion");
    }

    #[test]
    fn test_metadata_missing_fields_default() {
        let meta: SnapshotMetadata = serde_json::from_str(r#"{"user":"ana"}"#).unwrap();
        assert_eq!(meta.user.as_deref(), Some("ana"));
        assert_eq!(meta.checkpoint, CheckpointKind::Manual);
        assert!(!meta.partial);
    }

    #[test]
    fn test_blocks_get_set() {
        let mut blocks = DomainBlocks::default();
        blocks.set(SnapshotDomain::Tdd, Some("[]".into()));
        assert_eq!(blocks.get(SnapshotDomain::Tdd), Some("[]"));
        assert_eq!(blocks.get(SnapshotDomain::Science), None);
    }
}
