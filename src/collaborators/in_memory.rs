//! 进程内协作方实现
//!
//! 未接入真实子系统时作为默认实现，也用于测试。所有状态放在 tokio RwLock 里，
//! ID 使用带前缀的 UUID（mem_ / task_ / agent_），重建后的实体必然拿到新 ID。

use std::collections::HashMap;
use std::time::Instant;

use anyhow::{anyhow, bail};
use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use super::{
    AgentExecution, AgentTracker, ExecutionStatus, MemoryEntry, MemoryStore, NewTask,
    PlanningStore, TaskRecord, TaskStatus, TddRunner, TestOutcome, TestRun, TestRunStatus,
};

/// 跟进标签
pub const FOLLOW_UP_TAG: &str = "follow-up";

// ---------- 记忆库 ----------

#[derive(Default)]
pub struct InMemoryMemoryStore {
    /// (id, entry)，按写入顺序
    entries: RwLock<Vec<(String, MemoryEntry)>>,
}

impl InMemoryMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// 按 key 查找（最新写入的优先）
    pub async fn get(&self, key: &str) -> Option<MemoryEntry> {
        self.entries
            .read()
            .await
            .iter()
            .rev()
            .find(|(_, e)| e.key == key)
            .map(|(_, e)| e.clone())
    }
}

#[async_trait]
impl MemoryStore for InMemoryMemoryStore {
    async fn list_all(&self) -> anyhow::Result<Vec<MemoryEntry>> {
        Ok(self.entries.read().await.iter().map(|(_, e)| e.clone()).collect())
    }

    async fn create(&self, entry: MemoryEntry) -> anyhow::Result<String> {
        if entry.key.trim().is_empty() {
            bail!("memory key must not be empty");
        }
        let id = format!("mem_{}", uuid::Uuid::new_v4());
        self.entries.write().await.push((id.clone(), entry));
        Ok(id)
    }
}

// ---------- 任务规划 ----------

#[derive(Default)]
pub struct InMemoryPlanningStore {
    tasks: RwLock<Vec<TaskRecord>>,
    /// 任务 ID -> 跟进原因
    follow_ups: RwLock<HashMap<String, String>>,
}

impl InMemoryPlanningStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, id: &str) -> Option<TaskRecord> {
        self.tasks.read().await.iter().find(|t| t.id == id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.tasks.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn follow_up_reason(&self, id: &str) -> Option<String> {
        self.follow_ups.read().await.get(id).cloned()
    }
}

#[async_trait]
impl PlanningStore for InMemoryPlanningStore {
    async fn list_all(&self) -> anyhow::Result<Vec<TaskRecord>> {
        Ok(self.tasks.read().await.clone())
    }

    async fn create(&self, task: NewTask, parent_id: Option<&str>) -> anyhow::Result<String> {
        let mut tasks = self.tasks.write().await;
        if let Some(parent) = parent_id {
            if !tasks.iter().any(|t| t.id == parent) {
                bail!("parent task not found: {parent}");
            }
        }
        let now = Utc::now();
        let id = format!("task_{}", uuid::Uuid::new_v4());
        tasks.push(TaskRecord {
            id: id.clone(),
            content: task.content,
            status: task.status,
            tags: task.tags,
            parent_id: parent_id.map(str::to_string),
            task_type: task.task_type,
            cycle_status: task.cycle_status,
            test_path: task.test_path,
            created_at: now,
            updated_at: now,
            completed_at: (task.status == TaskStatus::Completed).then_some(now),
        });
        Ok(id)
    }

    async fn mark_completed(&self, id: &str) -> anyhow::Result<()> {
        let mut tasks = self.tasks.write().await;
        let task = tasks
            .iter_mut()
            .find(|t| t.id == id)
            .ok_or_else(|| anyhow!("task not found: {id}"))?;
        let now = Utc::now();
        task.status = TaskStatus::Completed;
        task.updated_at = now;
        task.completed_at = Some(now);
        Ok(())
    }

    async fn mark_follow_up(&self, id: &str, reason: &str) -> anyhow::Result<()> {
        {
            let mut tasks = self.tasks.write().await;
            let task = tasks
                .iter_mut()
                .find(|t| t.id == id)
                .ok_or_else(|| anyhow!("task not found: {id}"))?;
            if !task.tags.iter().any(|t| t == FOLLOW_UP_TAG) {
                task.tags.push(FOLLOW_UP_TAG.to_string());
            }
            task.updated_at = Utc::now();
        }
        self.follow_ups
            .write()
            .await
            .insert(id.to_string(), reason.to_string());
        Ok(())
    }
}

// ---------- Agent 追踪 ----------

#[derive(Default)]
pub struct InMemoryAgentTracker {
    history: RwLock<Vec<AgentExecution>>,
}

impl InMemoryAgentTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// 直接写入一条历史（导入外部记录或测试预置）
    pub async fn record(&self, execution: AgentExecution) {
        self.history.write().await.push(execution);
    }

    /// 标记执行结束
    pub async fn complete(&self, agent_id: &str, success: bool, result: impl Into<String>) -> anyhow::Result<()> {
        let mut history = self.history.write().await;
        let execution = history
            .iter_mut()
            .find(|e| e.id == agent_id)
            .ok_or_else(|| anyhow!("agent execution not found: {agent_id}"))?;
        execution.status = if success {
            ExecutionStatus::Completed
        } else {
            ExecutionStatus::Failed
        };
        execution.result = Some(result.into());
        execution.completed_at = Some(Utc::now());
        Ok(())
    }

    pub async fn get(&self, agent_id: &str) -> Option<AgentExecution> {
        self.history.read().await.iter().find(|e| e.id == agent_id).cloned()
    }
}

#[async_trait]
impl AgentTracker for InMemoryAgentTracker {
    async fn list_history(&self) -> anyhow::Result<Vec<AgentExecution>> {
        Ok(self.history.read().await.clone())
    }

    async fn dispatch(&self, task_description: &str) -> anyhow::Result<String> {
        let id = format!("agent_{}", uuid::Uuid::new_v4());
        self.history.write().await.push(AgentExecution {
            id: id.clone(),
            agent_type: "general".to_string(),
            status: ExecutionStatus::Running,
            result: Some(format!("dispatched: {task_description}")),
            started_at: Utc::now(),
            completed_at: None,
        });
        Ok(id)
    }
}

// ---------- TDD ----------

/// 测试路径 -> 预设结果；未预设的路径视为通过
#[derive(Default)]
pub struct InMemoryTddRunner {
    history: RwLock<Vec<TestRun>>,
    scripted: RwLock<HashMap<String, TestOutcome>>,
}

impl InMemoryTddRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_result(&self, test_path: impl Into<String>, passed: bool, output: impl Into<String>) {
        self.scripted.write().await.insert(
            test_path.into(),
            TestOutcome {
                passed,
                output: output.into(),
            },
        );
    }
}

#[async_trait]
impl TddRunner for InMemoryTddRunner {
    async fn list_history(&self) -> anyhow::Result<Vec<TestRun>> {
        Ok(self.history.read().await.clone())
    }

    async fn run(&self, test_path: &str) -> anyhow::Result<TestOutcome> {
        if test_path.trim().is_empty() {
            bail!("test path must not be empty");
        }
        let started = Instant::now();
        let outcome = self
            .scripted
            .read()
            .await
            .get(test_path)
            .cloned()
            .unwrap_or_else(|| TestOutcome {
                passed: true,
                output: format!("{test_path}: ok"),
            });
        self.history.write().await.push(TestRun {
            test_path: test_path.to_string(),
            status: if outcome.passed {
                TestRunStatus::Passed
            } else {
                TestRunStatus::Failed
            },
            runner: "in-memory".to_string(),
            output: outcome.output.clone(),
            duration_ms: started.elapsed().as_millis() as u64,
        });
        Ok(outcome)
    }
}
