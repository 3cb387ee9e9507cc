//! 只读汇总：并发查询各协作方，给出计数概览

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;

use crate::collaborators::{Collaborators, ExecutionStatus, TestRunStatus};
use crate::workflow::WorkflowOrchestrator;

/// 概览
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DashboardOverview {
    pub memory_entries: usize,
    pub tasks_total: usize,
    /// 状态名 -> 数量
    pub tasks_by_status: BTreeMap<String, usize>,
    pub agent_executions: usize,
    pub agents_running: usize,
    pub test_runs: usize,
    pub tests_passed: usize,
    pub active_workflows: usize,
    /// 查询失败的协作方及原因
    pub errors: BTreeMap<String, String>,
}

pub struct DashboardAggregator {
    collaborators: Collaborators,
    orchestrator: Option<Arc<WorkflowOrchestrator>>,
}

impl DashboardAggregator {
    pub fn new(collaborators: Collaborators) -> Self {
        Self {
            collaborators,
            orchestrator: None,
        }
    }

    pub fn with_orchestrator(mut self, orchestrator: Arc<WorkflowOrchestrator>) -> Self {
        self.orchestrator = Some(orchestrator);
        self
    }

    /// 单个协作方失败只记入 errors，不影响其它计数
    pub async fn overview(&self) -> DashboardOverview {
        let c = &self.collaborators;
        let (memory, tasks, agents, tests) = tokio::join!(
            c.memory.list_all(),
            c.planning.list_all(),
            c.agents.list_history(),
            c.tdd.list_history(),
        );

        let mut overview = DashboardOverview::default();
        match memory {
            Ok(entries) => overview.memory_entries = entries.len(),
            Err(e) => {
                overview.errors.insert("memory".into(), format!("{e:#}"));
            }
        }
        match tasks {
            Ok(tasks) => {
                overview.tasks_total = tasks.len();
                for task in &tasks {
                    *overview
                        .tasks_by_status
                        .entry(task.status.as_str().to_string())
                        .or_insert(0) += 1;
                }
            }
            Err(e) => {
                overview.errors.insert("planning".into(), format!("{e:#}"));
            }
        }
        match agents {
            Ok(history) => {
                overview.agent_executions = history.len();
                overview.agents_running = history
                    .iter()
                    .filter(|e| e.status == ExecutionStatus::Running)
                    .count();
            }
            Err(e) => {
                overview.errors.insert("agents".into(), format!("{e:#}"));
            }
        }
        match tests {
            Ok(runs) => {
                overview.test_runs = runs.len();
                overview.tests_passed = runs
                    .iter()
                    .filter(|r| r.status == TestRunStatus::Passed)
                    .count();
            }
            Err(e) => {
                overview.errors.insert("tdd".into(), format!("{e:#}"));
            }
        }
        if let Some(orchestrator) = &self.orchestrator {
            overview.active_workflows = orchestrator.active_count().await;
        }

        if !overview.errors.is_empty() {
            tracing::warn!("Dashboard overview incomplete: {:?}", overview.errors.keys());
        }
        overview
    }
}
