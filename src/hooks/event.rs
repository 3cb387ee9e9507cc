//! 钩子事件：事件类型、事件载荷、单次分发内共享的草稿区

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::core::FusionError;

/// 生命周期事件类型（封闭枚举）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HookEventKind {
    SessionStart,
    SessionEnd,
    PreToolUse,
    PostToolUse,
    /// 规划子系统创建任务之后
    PlanningCompleted,
    AgentStarted,
    AgentCompleted,
    TddCycleStarted,
    TddCycleCompleted,
    MemorySaved,
    MemoryRecalled,
    /// 上下文窗口将满，需要压缩前的检查点
    ContextFull,
    ProgressUpdate,
    /// 自定义事件，名称放在 data["name"]
    Custom,
}

impl HookEventKind {
    pub const ALL: [HookEventKind; 14] = [
        HookEventKind::SessionStart,
        HookEventKind::SessionEnd,
        HookEventKind::PreToolUse,
        HookEventKind::PostToolUse,
        HookEventKind::PlanningCompleted,
        HookEventKind::AgentStarted,
        HookEventKind::AgentCompleted,
        HookEventKind::TddCycleStarted,
        HookEventKind::TddCycleCompleted,
        HookEventKind::MemorySaved,
        HookEventKind::MemoryRecalled,
        HookEventKind::ContextFull,
        HookEventKind::ProgressUpdate,
        HookEventKind::Custom,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            HookEventKind::SessionStart => "session-start",
            HookEventKind::SessionEnd => "session-end",
            HookEventKind::PreToolUse => "pre-tool-use",
            HookEventKind::PostToolUse => "post-tool-use",
            HookEventKind::PlanningCompleted => "planning-completed",
            HookEventKind::AgentStarted => "agent-started",
            HookEventKind::AgentCompleted => "agent-completed",
            HookEventKind::TddCycleStarted => "tdd-cycle-started",
            HookEventKind::TddCycleCompleted => "tdd-cycle-completed",
            HookEventKind::MemorySaved => "memory-saved",
            HookEventKind::MemoryRecalled => "memory-recalled",
            HookEventKind::ContextFull => "context-full",
            HookEventKind::ProgressUpdate => "progress-update",
            HookEventKind::Custom => "custom",
        }
    }
}

impl fmt::Display for HookEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 按名称解析事件类型；未知名称是配置错误
impl FromStr for HookEventKind {
    type Err = FusionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = s.trim();
        Self::ALL
            .iter()
            .copied()
            .find(|kind| kind.as_str() == name)
            .ok_or_else(|| FusionError::UnknownEventKind(name.to_string()))
    }
}

/// 事件载荷：类型 + 关联 ID + 事件数据
///
/// `correlation_id` 用于把后续事件匹配到具体的工作流运行或实体（一次性续接按它查找）。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HookEvent {
    pub kind: HookEventKind,
    pub correlation_id: Option<String>,
    pub data: Map<String, Value>,
    pub fired_at: DateTime<Utc>,
}

impl HookEvent {
    pub fn new(kind: HookEventKind) -> Self {
        Self {
            kind,
            correlation_id: None,
            data: Map::new(),
            fired_at: Utc::now(),
        }
    }

    /// 用任意 JSON 构造；非对象值放在 data["value"] 下
    pub fn with_data(kind: HookEventKind, data: Value) -> Self {
        let mut event = Self::new(kind);
        match data {
            Value::Object(map) => event.data = map,
            Value::Null => {}
            other => {
                event.data.insert("value".to_string(), other);
            }
        }
        event
    }

    pub fn correlated(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(Value::as_str)
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.data.get(key).and_then(Value::as_bool)
    }

    /// 会话 ID：优先 data["session_id"]，否则回退到关联 ID
    pub fn session_id(&self) -> Option<&str> {
        self.get_str("session_id")
            .or(self.correlation_id.as_deref())
            .filter(|s| !s.is_empty())
    }
}

/// 单次 `fire` 调用内所有处理器共享的草稿区，分发结束即丢弃
pub type HookScratch = HashMap<String, Value>;

/// 处理器执行错误（被注册表捕获并记入分发报告）
#[derive(Debug, Error)]
pub enum HookError {
    #[error("Hook execution failed: {reason}")]
    ExecutionFailed { reason: String },

    #[error("Hook timed out after {timeout:?}")]
    Timeout { timeout: Duration },
}

impl HookError {
    pub fn failed(reason: impl fmt::Display) -> Self {
        HookError::ExecutionFailed {
            reason: reason.to_string(),
        }
    }
}

impl From<FusionError> for HookError {
    fn from(e: FusionError) -> Self {
        HookError::failed(e)
    }
}

impl From<anyhow::Error> for HookError {
    fn from(e: anyhow::Error) -> Self {
        HookError::failed(format!("{e:#}"))
    }
}
