//! 工作流类型定义
//!
//! 固定四阶段流水线：Planned → AgentDispatched → Verified → Recorded，任一非终态都可进入 Failed。

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type RunId = String;

/// 流水线阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum WorkflowStage {
    /// 已在规划子系统中创建任务
    Planned,
    /// 已派发 Agent
    AgentDispatched,
    /// 已验证（测试通过、失败或跳过）
    Verified,
    /// 已写入记忆
    Recorded,
}

impl WorkflowStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowStage::Planned => "planned",
            WorkflowStage::AgentDispatched => "agent_dispatched",
            WorkflowStage::Verified => "verified",
            WorkflowStage::Recorded => "recorded",
        }
    }
}

impl fmt::Display for WorkflowStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 运行状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkflowStatus {
    /// 正在执行（等待续接事件）
    Running,
    /// 四个阶段全部完成
    Completed,
    /// 某阶段失败（吸收态）
    Failed,
}

/// 测试结论
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TestVerdict {
    Passed,
    Failed,
    /// 未开启自动测试
    Skipped,
}

impl TestVerdict {
    /// 通过或跳过时任务可以标记完成
    pub fn completes_task(&self) -> bool {
        matches!(self, TestVerdict::Passed | TestVerdict::Skipped)
    }
}

/// 阶段失败记录：失败发生时正在尝试的阶段
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageFailure {
    pub stage: WorkflowStage,
    pub error: String,
    pub failed_at: DateTime<Utc>,
}

/// 一次流水线运行
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowRun {
    pub run_id: RunId,
    /// 规划子系统中的任务 ID；任务创建失败时为空
    pub task_id: Option<String>,
    pub description: String,
    pub agent_id: Option<String>,
    pub test_verdict: Option<TestVerdict>,
    pub test_output: Option<String>,
    pub test_path: Option<String>,
    /// 记录阶段写入的记忆 key
    pub memory_keys: Vec<String>,
    /// 已完成的阶段（按完成顺序）
    pub stages: Vec<WorkflowStage>,
    pub status: WorkflowStatus,
    pub failure: Option<StageFailure>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowRun {
    pub fn new(description: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            run_id: format!("wf_{}", uuid::Uuid::new_v4()),
            task_id: None,
            description: description.into(),
            agent_id: None,
            test_verdict: None,
            test_output: None,
            test_path: None,
            memory_keys: Vec::new(),
            stages: Vec::new(),
            status: WorkflowStatus::Running,
            failure: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status != WorkflowStatus::Running
    }

    pub fn has_reached(&self, stage: WorkflowStage) -> bool {
        self.stages.contains(&stage)
    }

    pub fn current_stage(&self) -> Option<WorkflowStage> {
        self.stages.last().copied()
    }

    /// 记录阶段完成；终态运行不再变化，重复阶段忽略。返回是否发生了变化
    pub fn advance(&mut self, stage: WorkflowStage) -> bool {
        if self.is_terminal() || self.has_reached(stage) {
            return false;
        }
        self.stages.push(stage);
        if stage == WorkflowStage::Recorded {
            self.status = WorkflowStatus::Completed;
        }
        self.updated_at = Utc::now();
        true
    }

    /// 进入 Failed；已是终态时返回 false
    pub fn fail(&mut self, stage: WorkflowStage, error: impl Into<String>) -> bool {
        if self.is_terminal() {
            return false;
        }
        let now = Utc::now();
        self.status = WorkflowStatus::Failed;
        self.failure = Some(StageFailure {
            stage,
            error: error.into(),
            failed_at: now,
        });
        self.updated_at = now;
        true
    }
}
