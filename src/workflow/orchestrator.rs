//! 工作流编排器
//!
//! 每次运行是一个小状态机，阶段之间通过钩子注册表上的一次性续接串联：
//!
//! ```text
//! start_workflow ──▶ Planned ──▶ AgentDispatched
//!                                   │ agent-completed (关联 task_id)
//!                                   ▼
//!                               Verified ──▶ tdd-cycle-completed ──▶ Recorded
//! ```
//!
//! 协作方调用失败或超时（`collaborator_timeout`）时运行进入 Failed，记录失败阶段，不回滚已完成的阶段。
//! 续接在独立任务中推进阶段，注册表的处理器超时不会让运行停在半途。
//! 运行表的锁从不跨越协作方调用或事件触发。

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::RwLock;

use crate::collaborators::{Collaborators, MemoryEntry, NewTask};
use crate::core::{FusionError, FusionResult};
use crate::hooks::{
    DispatchReport, HookError, HookEvent, HookEventKind, HookHandler, HookRegistry, HookScratch,
    RegistrationId,
};
use crate::workflow::builder::WorkflowRequest;
use crate::workflow::types::{RunId, TestVerdict, WorkflowRun, WorkflowStage, WorkflowStatus};

/// 续接处理器的优先级
pub const WORKFLOW_HOOK_PRIORITY: i32 = 500;

/// 编排器配置
#[derive(Debug, Clone)]
pub struct OrchestratorOptions {
    pub hook_priority: i32,
    /// 保留的终态运行数，超出时淘汰最早结束的
    pub max_retained_runs: usize,
    /// 记录阶段写入记忆时使用的分类
    pub memory_category: String,
    /// 单次协作方调用的等待上限；超时的运行在当前阶段进入 Failed。None 表示不限
    pub collaborator_timeout: Option<Duration>,
}

impl Default for OrchestratorOptions {
    fn default() -> Self {
        Self {
            hook_priority: WORKFLOW_HOOK_PRIORITY,
            max_retained_runs: 256,
            memory_category: "workflow".to_string(),
            collaborator_timeout: Some(Duration::from_secs(120)),
        }
    }
}

/// 运行期间需要的请求参数
#[derive(Debug, Clone)]
struct RunPlan {
    auto_run_tests: bool,
    tags: Vec<String>,
    memory_keys: Vec<String>,
}

#[derive(Default)]
struct RunTable {
    runs: HashMap<RunId, WorkflowRun>,
    plans: HashMap<RunId, RunPlan>,
    /// task_id -> run_id
    by_task: HashMap<String, RunId>,
    /// 等待中的一次性续接
    pending: HashMap<RunId, RegistrationId>,
    /// 终态运行，按结束顺序
    finished: VecDeque<RunId>,
}

impl RunTable {
    fn retire(&mut self, run_id: &str, max_retained: usize) {
        self.plans.remove(run_id);
        self.pending.remove(run_id);
        self.finished.push_back(run_id.to_string());
        while self.finished.len() > max_retained.max(1) {
            if let Some(evicted) = self.finished.pop_front() {
                if let Some(run) = self.runs.remove(&evicted) {
                    if let Some(task_id) = run.task_id {
                        if self.by_task.get(&task_id) == Some(&evicted) {
                            self.by_task.remove(&task_id);
                        }
                    }
                }
            }
        }
    }
}

/// 工作流编排器
pub struct WorkflowOrchestrator {
    registry: Arc<HookRegistry>,
    collaborators: Collaborators,
    options: OrchestratorOptions,
    table: RwLock<RunTable>,
    /// 续接处理器持有弱引用，注册表不会延长编排器的生命周期
    me: Weak<WorkflowOrchestrator>,
}

impl WorkflowOrchestrator {
    pub fn new(
        registry: Arc<HookRegistry>,
        collaborators: Collaborators,
        options: OrchestratorOptions,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            registry,
            collaborators,
            options,
            table: RwLock::new(RunTable::default()),
            me: me.clone(),
        })
    }

    /// 启动一次运行
    ///
    /// 请求无效时返回错误；协作方失败不返回错误，而是返回状态为 Failed 的运行。
    pub async fn start_workflow(&self, request: WorkflowRequest) -> FusionResult<WorkflowRun> {
        request.validate()?;

        let mut run = WorkflowRun::new(request.description.clone());
        run.test_path = request.test_path.clone();
        let run_id = run.run_id.clone();
        {
            let mut table = self.table.write().await;
            table.runs.insert(run_id.clone(), run);
            table.plans.insert(
                run_id.clone(),
                RunPlan {
                    auto_run_tests: request.auto_run_tests,
                    tags: request.tags.clone(),
                    memory_keys: request.memory_keys.clone(),
                },
            );
        }
        tracing::info!(run_id = %run_id, "Starting workflow: {}", request.description);

        // Planned
        let mut task = NewTask::new(request.description.clone()).with_tags(request.tags.clone());
        if let Some(path) = &request.test_path {
            task = task.with_test_path(path.clone());
        }
        let task_id = match self
            .call("planning.create", self.collaborators.planning.create(task, None))
            .await
        {
            Ok(id) => id,
            Err(e) => {
                self.fail_run(&run_id, WorkflowStage::Planned, &e).await;
                return self.run_snapshot(&run_id).await;
            }
        };
        {
            let mut table = self.table.write().await;
            table.by_task.insert(task_id.clone(), run_id.clone());
            if let Some(run) = table.runs.get_mut(&run_id) {
                run.task_id = Some(task_id.clone());
                run.advance(WorkflowStage::Planned);
            }
        }
        self.emit(
            HookEventKind::PlanningCompleted,
            &task_id,
            json!({ "run_id": run_id, "task_id": task_id, "description": request.description }),
        )
        .await;

        // agent-completed 续接，先注册再派发
        let continuation = self
            .registry
            .register_once(
                HookEventKind::AgentCompleted,
                task_id.clone(),
                Arc::new(AgentCompletedContinuation {
                    orchestrator: self.me.clone(),
                    run_id: run_id.clone(),
                }),
                self.options.hook_priority,
                format!("workflow {run_id}: verify after agent"),
            )
            .await;
        self.table
            .write()
            .await
            .pending
            .insert(run_id.clone(), continuation);

        if request.auto_start_agent {
            // 失败已记录在运行上
            if let Err(e) = self.dispatch(&run_id).await {
                tracing::debug!(run_id = %run_id, "Auto dispatch failed: {}", e);
            }
        }
        self.emit_progress(&run_id).await;
        self.run_snapshot(&run_id).await
    }

    /// 为未自动派发的运行手动派发 Agent
    pub async fn dispatch_agent(&self, task_id: &str) -> FusionResult<WorkflowRun> {
        let run_id = self
            .run_id_for_task(task_id)
            .await
            .ok_or_else(|| FusionError::InvalidWorkflow(format!("no workflow for task {task_id}")))?;
        let already = self
            .with_run(&run_id, |run| run.is_terminal() || run.agent_id.is_some())
            .await
            .unwrap_or(true);
        if !already {
            if let Err(e) = self.dispatch(&run_id).await {
                tracing::debug!(run_id = %run_id, "Manual dispatch failed: {}", e);
            }
            self.emit_progress(&run_id).await;
        }
        self.run_snapshot(&run_id).await
    }

    async fn dispatch(&self, run_id: &str) -> FusionResult<()> {
        let Some((task_id, description)) = self
            .with_run(run_id, |run| (run.task_id.clone(), run.description.clone()))
            .await
        else {
            return Ok(());
        };
        let task_id = task_id.unwrap_or_default();

        match self
            .call("agents.dispatch", self.collaborators.agents.dispatch(&description))
            .await
        {
            Ok(agent_id) => {
                self.with_run(run_id, |run| {
                    run.agent_id = Some(agent_id.clone());
                    run.advance(WorkflowStage::AgentDispatched);
                })
                .await;
                tracing::debug!(run_id, agent_id = %agent_id, "Agent dispatched");
                self.emit(
                    HookEventKind::AgentStarted,
                    &task_id,
                    json!({ "run_id": run_id, "task_id": task_id, "agent_id": agent_id }),
                )
                .await;
                Ok(())
            }
            Err(err) => {
                self.fail_run(run_id, WorkflowStage::AgentDispatched, &err).await;
                Err(err)
            }
        }
    }

    /// agent-completed 续接：AgentDispatched → Verified
    async fn on_agent_completed(&self, run_id: &str, event: &HookEvent) -> FusionResult<()> {
        let state = {
            let mut table = self.table.write().await;
            table.pending.remove(run_id);
            let plan = table.plans.get(run_id).cloned();
            table.runs.get(run_id).map(|run| (run.clone(), plan))
        };
        let Some((run, Some(plan))) = state else {
            return Ok(());
        };
        if run.is_terminal() {
            return Ok(());
        }
        let task_id = run.task_id.clone().unwrap_or_default();

        if event.get_bool("success") == Some(false) {
            let reason = event.get_str("error").unwrap_or("agent reported failure");
            let err = FusionError::Collaborator(format!("agent failed: {reason}"));
            self.fail_run(run_id, WorkflowStage::AgentDispatched, &err).await;
            return Err(err);
        }

        let agent_id = event.get_str("agent_id").map(str::to_string);
        self.with_run(run_id, |run| {
            if run.agent_id.is_none() {
                run.agent_id = agent_id;
            }
            run.advance(WorkflowStage::AgentDispatched);
        })
        .await;

        if !plan.auto_run_tests {
            self.with_run(run_id, |run| {
                run.test_verdict = Some(TestVerdict::Skipped);
                run.advance(WorkflowStage::Verified);
            })
            .await;
            self.emit_progress(run_id).await;
            return self.record(run_id).await;
        }

        let test_path = run.test_path.clone().unwrap_or_default();
        let continuation = self
            .registry
            .register_once(
                HookEventKind::TddCycleCompleted,
                task_id.clone(),
                Arc::new(TestsCompletedContinuation {
                    orchestrator: self.me.clone(),
                    run_id: run_id.to_string(),
                }),
                self.options.hook_priority,
                format!("workflow {run_id}: record after tests"),
            )
            .await;
        self.table
            .write()
            .await
            .pending
            .insert(run_id.to_string(), continuation);

        self.emit(
            HookEventKind::TddCycleStarted,
            &task_id,
            json!({ "run_id": run_id, "task_id": task_id, "test_path": test_path }),
        )
        .await;

        let outcome = match self.call("tdd.run", self.collaborators.tdd.run(&test_path)).await {
            Ok(outcome) => outcome,
            Err(err) => {
                self.fail_run(run_id, WorkflowStage::Verified, &err).await;
                return Err(err);
            }
        };

        // 测试失败是数据，不是编排故障
        let verdict = if outcome.passed {
            TestVerdict::Passed
        } else {
            TestVerdict::Failed
        };
        self.with_run(run_id, |run| {
            run.test_verdict = Some(verdict);
            run.test_output = Some(outcome.output.clone());
            run.advance(WorkflowStage::Verified);
        })
        .await;
        self.emit_progress(run_id).await;

        self.emit(
            HookEventKind::TddCycleCompleted,
            &task_id,
            json!({
                "run_id": run_id,
                "task_id": task_id,
                "test_path": test_path,
                "passed": outcome.passed,
                "output": outcome.output,
            }),
        )
        .await;
        Ok(())
    }

    /// tdd-cycle-completed 续接：Verified → Recorded
    ///
    /// 事件由外部触发时（运行尚无测试结论），从事件的 `passed` 字段得出结论。
    async fn on_tests_completed(&self, run_id: &str, event: &HookEvent) -> FusionResult<()> {
        let passed = event.get_bool("passed");
        let output = event.get_str("output").map(str::to_string);
        let ready = self
            .with_run(run_id, |run| {
                if run.is_terminal() {
                    return false;
                }
                if run.test_verdict.is_none() {
                    run.test_verdict = Some(match passed {
                        Some(true) => TestVerdict::Passed,
                        _ => TestVerdict::Failed,
                    });
                    run.test_output = output;
                }
                run.advance(WorkflowStage::Verified);
                true
            })
            .await
            .unwrap_or(false);
        self.table.write().await.pending.remove(run_id);
        if !ready {
            return Ok(());
        }
        self.record(run_id).await
    }

    /// Verified → Recorded：写入记忆，按测试结论完成任务或标记跟进
    async fn record(&self, run_id: &str) -> FusionResult<()> {
        let state = {
            let table = self.table.read().await;
            table
                .runs
                .get(run_id)
                .cloned()
                .zip(table.plans.get(run_id).cloned())
        };
        let Some((run, plan)) = state else {
            return Ok(());
        };
        let task_id = run.task_id.clone().unwrap_or_default();
        let verdict = run.test_verdict.unwrap_or(TestVerdict::Skipped);

        let keys = if plan.memory_keys.is_empty() {
            vec![format!("workflow:{task_id}")]
        } else {
            plan.memory_keys.clone()
        };
        let summary = json!({
            "run_id": run.run_id,
            "task_id": task_id,
            "description": run.description,
            "agent_id": run.agent_id,
            "test_path": run.test_path,
            "test_verdict": verdict,
            "test_output": run.test_output,
            "stages": run.stages,
        })
        .to_string();

        let mut tags = plan.tags.clone();
        tags.push("workflow".to_string());
        for key in &keys {
            let entry = MemoryEntry::new(key.clone(), summary.clone())
                .with_category(self.options.memory_category.clone())
                .with_tags(tags.clone());
            if let Err(err) = self.call("memory.create", self.collaborators.memory.create(entry)).await {
                self.fail_run(run_id, WorkflowStage::Recorded, &err).await;
                return Err(err);
            }
        }
        self.with_run(run_id, |run| run.memory_keys = keys.clone()).await;

        let planning = &self.collaborators.planning;
        let result = if verdict.completes_task() {
            self.call("planning.mark_completed", planning.mark_completed(&task_id))
                .await
        } else {
            let reason = format!(
                "tests failed: {}",
                run.test_output.as_deref().unwrap_or("no output")
            );
            self.call("planning.mark_follow_up", planning.mark_follow_up(&task_id, &reason))
                .await
        };
        if let Err(err) = result {
            self.fail_run(run_id, WorkflowStage::Recorded, &err).await;
            return Err(err);
        }

        {
            let mut table = self.table.write().await;
            if let Some(run) = table.runs.get_mut(run_id) {
                run.advance(WorkflowStage::Recorded);
            }
            table.retire(run_id, self.options.max_retained_runs);
        }
        tracing::info!(run_id, task_id = %task_id, verdict = ?verdict, "Workflow completed");

        self.emit(
            HookEventKind::MemorySaved,
            &task_id,
            json!({ "run_id": run_id, "task_id": task_id, "keys": keys }),
        )
        .await;
        self.emit_progress(run_id).await;
        Ok(())
    }

    /// 运行进入 Failed，撤销等待中的续接
    async fn fail_run(&self, run_id: &str, stage: WorkflowStage, err: &FusionError) {
        let pending = {
            let mut table = self.table.write().await;
            let changed = table
                .runs
                .get_mut(run_id)
                .map(|run| run.fail(stage, err.to_string()))
                .unwrap_or(false);
            if !changed {
                return;
            }
            let pending = table.pending.get(run_id).copied();
            table.retire(run_id, self.options.max_retained_runs);
            pending
        };
        if let Some(id) = pending {
            self.registry.unregister(id).await;
        }
        tracing::warn!(run_id, stage = %stage, "Workflow failed: {}", err);
        self.emit_progress(run_id).await;
    }

    /// 按任务 ID 查询运行
    pub async fn get_workflow_status(&self, task_id: &str) -> Option<WorkflowRun> {
        let table = self.table.read().await;
        let run_id = table.by_task.get(task_id)?;
        table.runs.get(run_id).cloned()
    }

    pub async fn get_run(&self, run_id: &str) -> Option<WorkflowRun> {
        self.table.read().await.runs.get(run_id).cloned()
    }

    /// 全部保留的运行（按创建时间）
    pub async fn list_runs(&self) -> Vec<WorkflowRun> {
        let mut runs: Vec<WorkflowRun> = self.table.read().await.runs.values().cloned().collect();
        runs.sort_by_key(|r| r.created_at);
        runs
    }

    /// 未到终态的运行数
    pub async fn active_count(&self) -> usize {
        self.table
            .read()
            .await
            .runs
            .values()
            .filter(|r| r.status == WorkflowStatus::Running)
            .count()
    }

    /// 协作方调用：失败与超时都转为 Collaborator 错误
    async fn call<T>(
        &self,
        operation: &str,
        fut: impl Future<Output = anyhow::Result<T>>,
    ) -> FusionResult<T> {
        let result = match self.options.collaborator_timeout {
            Some(limit) => tokio::time::timeout(limit, fut).await.map_err(|_| {
                FusionError::Collaborator(format!("{operation} timed out after {limit:?}"))
            })?,
            None => fut.await,
        };
        result.map_err(FusionError::collaborator)
    }

    async fn run_id_for_task(&self, task_id: &str) -> Option<RunId> {
        self.table.read().await.by_task.get(task_id).cloned()
    }

    async fn with_run<T>(&self, run_id: &str, f: impl FnOnce(&mut WorkflowRun) -> T) -> Option<T> {
        self.table.write().await.runs.get_mut(run_id).map(f)
    }

    async fn run_snapshot(&self, run_id: &str) -> FusionResult<WorkflowRun> {
        self.get_run(run_id)
            .await
            .ok_or_else(|| FusionError::InvalidWorkflow(format!("workflow run evicted: {run_id}")))
    }

    async fn emit(&self, kind: HookEventKind, task_id: &str, data: Value) -> DispatchReport {
        let mut event = HookEvent::with_data(kind, data);
        if !task_id.is_empty() {
            event = event.correlated(task_id);
        }
        let report = self.registry.fire(event).await;
        if !report.is_success() {
            tracing::debug!(kind = %kind, failed = report.failed, "Observers failed");
        }
        report
    }

    async fn emit_progress(&self, run_id: &str) {
        let Some(run) = self.get_run(run_id).await else {
            return;
        };
        let task_id = run.task_id.clone().unwrap_or_default();
        self.emit(
            HookEventKind::ProgressUpdate,
            &task_id,
            json!({
                "run_id": run.run_id,
                "task_id": run.task_id,
                "stage": run.current_stage(),
                "status": run.status,
            }),
        )
        .await;
    }
}

fn orchestrator_gone() -> HookError {
    HookError::failed("workflow orchestrator has been dropped")
}

struct AgentCompletedContinuation {
    orchestrator: Weak<WorkflowOrchestrator>,
    run_id: RunId,
}

#[async_trait]
impl HookHandler for AgentCompletedContinuation {
    async fn handle(&self, event: &HookEvent, _scratch: &mut HookScratch) -> Result<(), HookError> {
        let orchestrator = self.orchestrator.upgrade().ok_or_else(orchestrator_gone)?;
        let run_id = self.run_id.clone();
        let event = event.clone();
        // 阶段在独立任务中推进：处理器超时只记入分发报告，不会中断阶段
        let stage = tokio::spawn(async move { orchestrator.on_agent_completed(&run_id, &event).await });
        stage.await.map_err(FusionError::from)??;
        Ok(())
    }
}

struct TestsCompletedContinuation {
    orchestrator: Weak<WorkflowOrchestrator>,
    run_id: RunId,
}

#[async_trait]
impl HookHandler for TestsCompletedContinuation {
    async fn handle(&self, event: &HookEvent, _scratch: &mut HookScratch) -> Result<(), HookError> {
        let orchestrator = self.orchestrator.upgrade().ok_or_else(orchestrator_gone)?;
        let run_id = self.run_id.clone();
        let event = event.clone();
        let stage = tokio::spawn(async move { orchestrator.on_tests_completed(&run_id, &event).await });
        stage.await.map_err(FusionError::from)??;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use anyhow::bail;

    use crate::collaborators::{
        AgentExecution, AgentTracker, InMemoryAgentTracker, InMemoryMemoryStore,
        InMemoryPlanningStore, InMemoryTddRunner, TaskStatus, TddRunner, TestOutcome, TestRun,
    };
    use crate::hooks::hook_fn;
    use crate::workflow::builder::WorkflowBuilder;

    struct Fixture {
        registry: Arc<HookRegistry>,
        memory: Arc<InMemoryMemoryStore>,
        planning: Arc<InMemoryPlanningStore>,
        tdd: Arc<InMemoryTddRunner>,
        orchestrator: Arc<WorkflowOrchestrator>,
    }

    fn fixture_with(agents: Arc<dyn AgentTracker>, options: OrchestratorOptions) -> Fixture {
        let registry = Arc::new(HookRegistry::new());
        let memory = Arc::new(InMemoryMemoryStore::new());
        let planning = Arc::new(InMemoryPlanningStore::new());
        let tdd = Arc::new(InMemoryTddRunner::new());
        let collaborators = Collaborators::new(memory.clone(), planning.clone(), agents, tdd.clone());
        let orchestrator = WorkflowOrchestrator::new(registry.clone(), collaborators, options);
        Fixture {
            registry,
            memory,
            planning,
            tdd,
            orchestrator,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(Arc::new(InMemoryAgentTracker::new()), OrchestratorOptions::default())
    }

    async fn complete_agent(registry: &HookRegistry, task_id: &str, success: bool) -> DispatchReport {
        registry
            .fire(
                HookEvent::new(HookEventKind::AgentCompleted)
                    .correlated(task_id)
                    .with("success", success),
            )
            .await
    }

    /// 测试执行需要 `delay` 才返回
    struct SlowTdd {
        delay: Duration,
    }

    #[async_trait]
    impl TddRunner for SlowTdd {
        async fn list_history(&self) -> anyhow::Result<Vec<TestRun>> {
            Ok(Vec::new())
        }

        async fn run(&self, _test_path: &str) -> anyhow::Result<TestOutcome> {
            tokio::time::sleep(self.delay).await;
            Ok(TestOutcome {
                passed: true,
                output: "ok".to_string(),
            })
        }
    }

    /// 注册表带 50ms 处理器超时，测试执行较慢
    fn slow_tdd_fixture(delay: Duration, collaborator_timeout: Option<Duration>) -> Fixture {
        let registry =
            Arc::new(HookRegistry::new().with_handler_timeout(Some(Duration::from_millis(50))));
        let memory = Arc::new(InMemoryMemoryStore::new());
        let planning = Arc::new(InMemoryPlanningStore::new());
        let collaborators = Collaborators::new(
            memory.clone(),
            planning.clone(),
            Arc::new(InMemoryAgentTracker::new()),
            Arc::new(SlowTdd { delay }),
        );
        let orchestrator = WorkflowOrchestrator::new(
            registry.clone(),
            collaborators,
            OrchestratorOptions {
                collaborator_timeout,
                ..OrchestratorOptions::default()
            },
        );
        Fixture {
            registry,
            memory,
            planning,
            tdd: Arc::new(InMemoryTddRunner::new()),
            orchestrator,
        }
    }

    async fn start_with_tests(orchestrator: &WorkflowOrchestrator) -> String {
        let request = WorkflowBuilder::new("add auth")
            .auto_run_tests(true)
            .test_path("tests/auth.test")
            .build()
            .unwrap();
        orchestrator.start_workflow(request).await.unwrap().task_id.unwrap()
    }

    struct BrokenAgents;

    #[async_trait]
    impl AgentTracker for BrokenAgents {
        async fn list_history(&self) -> anyhow::Result<Vec<AgentExecution>> {
            Ok(Vec::new())
        }

        async fn dispatch(&self, _task_description: &str) -> anyhow::Result<String> {
            bail!("agent pool exhausted")
        }
    }

    #[tokio::test]
    async fn test_happy_path_without_tests() {
        let f = fixture();
        let run = f
            .orchestrator
            .start_workflow(WorkflowBuilder::new("add auth").build().unwrap())
            .await
            .unwrap();
        assert_eq!(run.stages, vec![WorkflowStage::Planned, WorkflowStage::AgentDispatched]);
        assert!(run.agent_id.is_some());
        let task_id = run.task_id.clone().unwrap();

        let report = complete_agent(&f.registry, &task_id, true).await;
        assert!(report.is_success());

        let run = f.orchestrator.get_workflow_status(&task_id).await.unwrap();
        assert_eq!(run.status, WorkflowStatus::Completed);
        assert_eq!(run.test_verdict, Some(TestVerdict::Skipped));
        assert_eq!(run.stages.len(), 4);
        assert_eq!(f.planning.get(&task_id).await.unwrap().status, TaskStatus::Completed);

        let key = format!("workflow:{task_id}");
        let entry = f.memory.get(&key).await.unwrap();
        assert_eq!(entry.category.as_deref(), Some("workflow"));
        let summary: Value = serde_json::from_str(&entry.value).unwrap();
        assert_eq!(summary["test_verdict"], "Skipped");
    }

    #[tokio::test]
    async fn test_other_runs_ignore_foreign_completion() {
        let f = fixture();
        let a = f
            .orchestrator
            .start_workflow(WorkflowBuilder::new("run a").build().unwrap())
            .await
            .unwrap();
        let b = f
            .orchestrator
            .start_workflow(WorkflowBuilder::new("run b").build().unwrap())
            .await
            .unwrap();

        complete_agent(&f.registry, a.task_id.as_deref().unwrap(), true).await;
        let b_now = f.orchestrator.get_run(&b.run_id).await.unwrap();
        assert_eq!(b_now.status, WorkflowStatus::Running);
        assert_eq!(b_now.stages.len(), 2);

        // 续接只执行一次
        let again = complete_agent(&f.registry, a.task_id.as_deref().unwrap(), true).await;
        assert!(again.is_empty());
    }

    #[tokio::test]
    async fn test_dispatch_failure_fails_run() {
        let f = fixture_with(Arc::new(BrokenAgents), OrchestratorOptions::default());
        let run = f
            .orchestrator
            .start_workflow(WorkflowBuilder::new("add auth").build().unwrap())
            .await
            .unwrap();
        assert_eq!(run.status, WorkflowStatus::Failed);
        assert_eq!(run.stages, vec![WorkflowStage::Planned]);
        let failure = run.failure.unwrap();
        assert_eq!(failure.stage, WorkflowStage::AgentDispatched);
        assert!(failure.error.contains("agent pool exhausted"));

        // 续接已撤销，任务保持未完成
        assert!(f.registry.is_empty().await);
        let task_id = run.task_id.unwrap();
        assert_eq!(f.planning.get(&task_id).await.unwrap().status, TaskStatus::Pending);
    }

    #[tokio::test]
    async fn test_agent_reported_failure() {
        let f = fixture();
        let run = f
            .orchestrator
            .start_workflow(WorkflowBuilder::new("add auth").build().unwrap())
            .await
            .unwrap();
        let task_id = run.task_id.unwrap();

        let report = complete_agent(&f.registry, &task_id, false).await;
        assert_eq!(report.failed, 1);
        let run = f.orchestrator.get_workflow_status(&task_id).await.unwrap();
        assert_eq!(run.status, WorkflowStatus::Failed);
        assert_eq!(run.failure.unwrap().stage, WorkflowStage::AgentDispatched);
        assert!(f.memory.is_empty().await);
    }

    #[tokio::test]
    async fn test_manual_dispatch() {
        let f = fixture();
        let run = f
            .orchestrator
            .start_workflow(
                WorkflowBuilder::new("add auth")
                    .auto_start_agent(false)
                    .build()
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(run.stages, vec![WorkflowStage::Planned]);
        let task_id = run.task_id.unwrap();

        let run = f.orchestrator.dispatch_agent(&task_id).await.unwrap();
        assert_eq!(run.current_stage(), Some(WorkflowStage::AgentDispatched));
        assert!(f.orchestrator.dispatch_agent("task_missing").await.is_err());
    }

    #[tokio::test]
    async fn test_failed_tests_leave_task_for_follow_up() {
        let f = fixture();
        f.tdd.set_result("tests/auth.test", false, "boom").await;
        let run = f
            .orchestrator
            .start_workflow(
                WorkflowBuilder::new("add auth")
                    .auto_run_tests(true)
                    .test_path("tests/auth.test")
                    .build()
                    .unwrap(),
            )
            .await
            .unwrap();
        let task_id = run.task_id.unwrap();
        complete_agent(&f.registry, &task_id, true).await;

        let run = f.orchestrator.get_workflow_status(&task_id).await.unwrap();
        assert_eq!(run.test_verdict, Some(TestVerdict::Failed));
        assert_eq!(run.status, WorkflowStatus::Completed);
        assert_eq!(
            f.planning.follow_up_reason(&task_id).await.as_deref(),
            Some("tests failed: boom")
        );
    }

    #[tokio::test]
    async fn test_progress_events_carry_task_id() {
        let f = fixture();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        f.registry
            .register(
                HookEventKind::ProgressUpdate,
                hook_fn(move |event, _| {
                    let stage = event.get("stage").cloned().unwrap_or(Value::Null);
                    seen_clone.lock().unwrap().push((event.correlation_id.clone(), stage));
                    Ok(())
                }),
                0,
                "progress log",
            )
            .await;

        let run = f
            .orchestrator
            .start_workflow(WorkflowBuilder::new("add auth").build().unwrap())
            .await
            .unwrap();
        let task_id = run.task_id.unwrap();
        complete_agent(&f.registry, &task_id, true).await;

        let seen = seen.lock().unwrap();
        assert!(seen.iter().all(|(cid, _)| cid.as_deref() == Some(task_id.as_str())));
        assert_eq!(seen.last().unwrap().1, json!("Recorded"));
    }

    #[tokio::test]
    async fn test_retention_evicts_oldest_finished() {
        let f = fixture_with(
            Arc::new(InMemoryAgentTracker::new()),
            OrchestratorOptions {
                max_retained_runs: 1,
                ..OrchestratorOptions::default()
            },
        );
        let mut task_ids = Vec::new();
        for name in ["one", "two"] {
            let run = f
                .orchestrator
                .start_workflow(WorkflowBuilder::new(name).build().unwrap())
                .await
                .unwrap();
            let task_id = run.task_id.unwrap();
            complete_agent(&f.registry, &task_id, true).await;
            task_ids.push(task_id);
        }
        assert!(f.orchestrator.get_workflow_status(&task_ids[0]).await.is_none());
        assert!(f.orchestrator.get_workflow_status(&task_ids[1]).await.is_some());
        assert_eq!(f.orchestrator.list_runs().await.len(), 1);
    }

    #[tokio::test]
    async fn test_slow_tests_fail_run_at_verified() {
        let f = slow_tdd_fixture(Duration::from_millis(300), Some(Duration::from_millis(100)));
        let task_id = start_with_tests(&f.orchestrator).await;

        // 处理器超时只记入报告
        let report = complete_agent(&f.registry, &task_id, true).await;
        assert_eq!(report.failed, 1);

        tokio::time::sleep(Duration::from_millis(250)).await;
        let run = f.orchestrator.get_workflow_status(&task_id).await.unwrap();
        assert_eq!(run.status, WorkflowStatus::Failed);
        assert_eq!(run.stages, vec![WorkflowStage::Planned, WorkflowStage::AgentDispatched]);
        let failure = run.failure.unwrap();
        assert_eq!(failure.stage, WorkflowStage::Verified);
        assert!(failure.error.contains("timed out"));

        // 等待中的 tdd-cycle-completed 续接已撤销
        assert!(f.registry.is_empty().await);
        assert_eq!(f.orchestrator.active_count().await, 0);
        assert_ne!(f.planning.get(&task_id).await.unwrap().status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn test_handler_timeout_does_not_interrupt_stage() {
        let f = slow_tdd_fixture(Duration::from_millis(150), None);
        let task_id = start_with_tests(&f.orchestrator).await;

        let report = complete_agent(&f.registry, &task_id, true).await;
        assert_eq!(report.failed, 1);

        tokio::time::sleep(Duration::from_millis(400)).await;
        let run = f.orchestrator.get_workflow_status(&task_id).await.unwrap();
        assert_eq!(run.status, WorkflowStatus::Completed);
        assert_eq!(run.test_verdict, Some(TestVerdict::Passed));
        assert_eq!(run.stages.len(), 4);
        assert_eq!(f.planning.get(&task_id).await.unwrap().status, TaskStatus::Completed);
        assert!(f.memory.get(&format!("workflow:{task_id}")).await.is_some());
        assert!(f.registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_named_completion_advances_run() {
        let f = fixture();
        let run = f
            .orchestrator
            .start_workflow(WorkflowBuilder::new("add auth").build().unwrap())
            .await
            .unwrap();
        let task_id = run.task_id.unwrap();

        let report = f
            .registry
            .fire_named("agent-completed", json!({ "task_id": task_id, "success": true }))
            .await
            .unwrap();
        assert_eq!(report.succeeded, 1);
        let run = f.orchestrator.get_workflow_status(&task_id).await.unwrap();
        assert_eq!(run.status, WorkflowStatus::Completed);
    }

    #[tokio::test]
    async fn test_invalid_request_rejected() {
        let f = fixture();
        let request = WorkflowRequest {
            description: "add auth".to_string(),
            tags: Vec::new(),
            auto_start_agent: true,
            auto_run_tests: true,
            test_path: None,
            memory_keys: Vec::new(),
        };
        let err = f.orchestrator.start_workflow(request).await.unwrap_err();
        assert!(matches!(err, FusionError::InvalidWorkflow(_)));
        assert!(f.planning.is_empty().await);
    }
}
