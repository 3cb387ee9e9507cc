//! 协作方接口：记忆库、任务规划、Agent 执行记录、TDD 测试
//!
//! 协调层只通过这些窄接口读写外部子系统，不关心其内部存储与检索。
//! 调用失败统一以 `anyhow::Error` 返回，由调用方转为报告条目。

pub mod in_memory;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use in_memory::{InMemoryAgentTracker, InMemoryMemoryStore, InMemoryPlanningStore, InMemoryTddRunner};

/// 记忆条目
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryEntry {
    pub key: String,
    pub value: String,
    pub category: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub access_count: u64,
    pub expires_at: Option<DateTime<Utc>>,
}

impl MemoryEntry {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            category: None,
            tags: Vec::new(),
            created_at: Utc::now(),
            access_count: 0,
            expires_at: None,
        }
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }
}

/// 任务状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Completed => "completed",
        }
    }
}

/// 规划子系统中的任务
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: String,
    pub content: String,
    pub status: TaskStatus,
    #[serde(default)]
    pub tags: Vec<String>,
    pub parent_id: Option<String>,
    /// 任务类型（如 "tdd_cycle"）
    pub task_type: Option<String>,
    /// TDD 循环阶段（red / green / refactor）
    pub cycle_status: Option<String>,
    pub test_path: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl TaskRecord {
    /// 重建任务时使用的字段（ID 与时间戳由规划子系统重新生成）
    pub fn to_new_task(&self) -> NewTask {
        NewTask {
            content: self.content.clone(),
            status: self.status,
            tags: self.tags.clone(),
            task_type: self.task_type.clone(),
            cycle_status: self.cycle_status.clone(),
            test_path: self.test_path.clone(),
        }
    }
}

/// 创建任务的参数
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewTask {
    pub content: String,
    pub status: TaskStatus,
    pub tags: Vec<String>,
    pub task_type: Option<String>,
    pub cycle_status: Option<String>,
    pub test_path: Option<String>,
}

impl NewTask {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            status: TaskStatus::Pending,
            tags: Vec::new(),
            task_type: None,
            cycle_status: None,
            test_path: None,
        }
    }

    pub fn with_status(mut self, status: TaskStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    pub fn with_test_path(mut self, test_path: impl Into<String>) -> Self {
        self.test_path = Some(test_path.into());
        self
    }
}

/// Agent 执行状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Running,
    Completed,
    Failed,
}

/// Agent 执行记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentExecution {
    pub id: String,
    pub agent_type: String,
    pub status: ExecutionStatus,
    pub result: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestRunStatus {
    Passed,
    Failed,
    Error,
}

/// 一次测试运行的历史记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestRun {
    pub test_path: String,
    pub status: TestRunStatus,
    pub runner: String,
    pub output: String,
    pub duration_ms: u64,
}

/// `TddRunner::run` 的返回
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestOutcome {
    pub passed: bool,
    pub output: String,
}

/// 记忆库
#[async_trait]
pub trait MemoryStore: Send + Sync {
    async fn list_all(&self) -> anyhow::Result<Vec<MemoryEntry>>;

    /// 写入一条记忆，返回存储方分配的 ID（幂等性由存储方负责）
    async fn create(&self, entry: MemoryEntry) -> anyhow::Result<String>;
}

/// 任务规划
#[async_trait]
pub trait PlanningStore: Send + Sync {
    async fn list_all(&self) -> anyhow::Result<Vec<TaskRecord>>;

    /// 创建任务，返回新任务 ID；`parent_id` 必须是已存在的任务
    async fn create(&self, task: NewTask, parent_id: Option<&str>) -> anyhow::Result<String>;

    async fn mark_completed(&self, id: &str) -> anyhow::Result<()>;

    /// 标记任务需要跟进（保持未完成）
    async fn mark_follow_up(&self, id: &str, reason: &str) -> anyhow::Result<()>;
}

/// Agent 执行追踪
#[async_trait]
pub trait AgentTracker: Send + Sync {
    async fn list_history(&self) -> anyhow::Result<Vec<AgentExecution>>;

    /// 按任务描述派发 Agent，返回 Agent ID
    async fn dispatch(&self, task_description: &str) -> anyhow::Result<String>;
}

/// TDD 测试执行
#[async_trait]
pub trait TddRunner: Send + Sync {
    async fn list_history(&self) -> anyhow::Result<Vec<TestRun>>;

    async fn run(&self, test_path: &str) -> anyhow::Result<TestOutcome>;
}

/// 协调层使用的全部协作方
#[derive(Clone)]
pub struct Collaborators {
    pub memory: Arc<dyn MemoryStore>,
    pub planning: Arc<dyn PlanningStore>,
    pub agents: Arc<dyn AgentTracker>,
    pub tdd: Arc<dyn TddRunner>,
}

impl Collaborators {
    pub fn new(
        memory: Arc<dyn MemoryStore>,
        planning: Arc<dyn PlanningStore>,
        agents: Arc<dyn AgentTracker>,
        tdd: Arc<dyn TddRunner>,
    ) -> Self {
        Self {
            memory,
            planning,
            agents,
            tdd,
        }
    }

    /// 全部使用进程内实现
    pub fn in_memory() -> Self {
        Self::new(
            Arc::new(InMemoryMemoryStore::new()),
            Arc::new(InMemoryPlanningStore::new()),
            Arc::new(InMemoryAgentTracker::new()),
            Arc::new(InMemoryTddRunner::new()),
        )
    }
}
