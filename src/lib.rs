//! Fusion - 智能体协作协调层
//!
//! 模块划分：
//! - **collaborators**: 记忆、规划、Agent 追踪、TDD 四个协作方的 trait 与进程内实现
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误类型、Fusion 构建与关闭
//! - **dashboard**: 跨协作方的只读汇总
//! - **hooks**: 事件钩子注册表（优先级分发、故障隔离、一次性续接）
//! - **observability**: tracing 订阅器初始化
//! - **recovery**: 上下文快照、持久化与恢复
//! - **workflow**: 规划 → Agent → 测试 → 记录 的工作流编排

pub mod collaborators;
pub mod config;
pub mod core;
pub mod dashboard;
pub mod hooks;
pub mod observability;
pub mod recovery;
pub mod workflow;

pub use crate::core::{Fusion, FusionBuilder, FusionError, FusionResult};
pub use collaborators::Collaborators;
pub use config::{load_config, FusionConfig};
pub use dashboard::{DashboardAggregator, DashboardOverview};
pub use hooks::{DispatchReport, HookEvent, HookEventKind, HookHandler, HookRegistry};
pub use recovery::{ContextRecoveryManager, RestorationReport};
pub use workflow::{WorkflowBuilder, WorkflowOrchestrator, WorkflowRun};
