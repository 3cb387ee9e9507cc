//! 上下文恢复管理器
//!
//! - capture：只读地收集各协作方的状态
//! - save：每个领域独立序列化，单个领域失败不影响其它领域（快照标记为 partial）
//! - restore：记忆逐条重建；任务按父子关系拓扑顺序重建，并通过 [`RestoredIdMap`] 改写父引用
//! - 钩子：session-end / context-full 保存检查点，session-start 只列出可恢复会话，不自动恢复

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::collaborators::{Collaborators, MemoryEntry, TaskRecord};
use crate::core::{FusionError, FusionResult};
use crate::hooks::{HookError, HookEvent, HookEventKind, HookHandler, HookRegistry, HookScratch, RegistrationId};
use crate::recovery::graph::TaskGraph;
use crate::recovery::snapshot::{
    AgentExecutionRef, CheckpointKind, ContextSnapshot, ContextState, DomainBlocks,
    RecoveryStatistics, SessionFilter, SessionSummary, SnapshotDomain, SnapshotMetadata, TestRunRef,
};
use crate::recovery::store::SnapshotStore;

/// 恢复处理器的优先级（高于其它观察者，保证它们看到的是已落盘的状态）
pub const RECOVERY_HOOK_PRIORITY: i32 = 1000;

/// session-end / context-full 处理器写入草稿区的快照 ID
pub const SCRATCH_SNAPSHOT_ID: &str = "recovery.snapshot_id";
/// session-start 处理器写入草稿区的可恢复会话列表
pub const SCRATCH_AVAILABLE_SESSIONS: &str = "recovery.available_sessions";

/// 恢复管理器配置
#[derive(Debug, Clone)]
pub struct RecoveryOptions {
    pub hook_priority: i32,
    /// session-start 时列出的会话数上限
    pub session_list_limit: usize,
    /// 单个领域区块的序列化上限（字节）
    pub max_block_bytes: usize,
}

impl Default for RecoveryOptions {
    fn default() -> Self {
        Self {
            hook_priority: RECOVERY_HOOK_PRIORITY,
            session_list_limit: 10,
            max_block_bytes: 4 * 1024 * 1024,
        }
    }
}

/// 恢复期间的旧 ID -> 新 ID 映射，只在一次 restore 调用内有效
#[derive(Debug, Default)]
pub struct RestoredIdMap {
    map: HashMap<String, String>,
}

impl RestoredIdMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, old_id: impl Into<String>, new_id: impl Into<String>) {
        self.map.insert(old_id.into(), new_id.into());
    }

    /// 旧 ID 对应的新 ID；未重建的返回 None（引用被丢弃，实体成为根）
    pub fn resolve(&self, old_id: &str) -> Option<&str> {
        self.map.get(old_id).map(String::as_str)
    }
}

/// 恢复报告
#[derive(Debug, Clone, Serialize)]
pub struct RestorationReport {
    pub snapshot_id: String,
    pub session_id: String,
    pub success: bool,
    pub error: Option<String>,
    pub memory_restored: usize,
    pub tasks_restored: usize,
    /// 仅供展示，不会重建
    pub agents: Vec<AgentExecutionRef>,
    pub test_runs: Vec<TestRunRef>,
    /// 恢复失败的领域及原因
    pub domain_errors: BTreeMap<SnapshotDomain, String>,
    /// 保存时就未写入的领域
    pub missing_domains: Vec<SnapshotDomain>,
    pub partial_snapshot: bool,
}

impl RestorationReport {
    fn new(snapshot: &ContextSnapshot) -> Self {
        Self {
            snapshot_id: snapshot.id.clone(),
            session_id: snapshot.session_id.clone(),
            success: false,
            error: None,
            memory_restored: 0,
            tasks_restored: 0,
            agents: Vec::new(),
            test_runs: Vec::new(),
            domain_errors: BTreeMap::new(),
            missing_domains: Vec::new(),
            partial_snapshot: snapshot.metadata.partial,
        }
    }

    pub fn restored(&self, domain: SnapshotDomain) -> usize {
        match domain {
            SnapshotDomain::Memory => self.memory_restored,
            SnapshotDomain::Planning => self.tasks_restored,
            _ => 0,
        }
    }

    fn fail_domain(&mut self, domain: SnapshotDomain, error: impl ToString) {
        let error = error.to_string();
        tracing::warn!(session_id = %self.session_id, domain = %domain, "Restore failed: {}", error);
        self.domain_errors.entry(domain).or_insert(error);
    }

    fn finish(&mut self) {
        self.success = self.domain_errors.is_empty();
        if !self.success {
            let causes: Vec<String> = self
                .domain_errors
                .iter()
                .map(|(domain, e)| format!("{domain}: {e}"))
                .collect();
            self.error = Some(causes.join("; "));
        }
    }
}

/// 上下文恢复管理器
pub struct ContextRecoveryManager {
    store: Arc<dyn SnapshotStore>,
    collaborators: Collaborators,
    options: RecoveryOptions,
}

impl ContextRecoveryManager {
    pub fn new(store: Arc<dyn SnapshotStore>, collaborators: Collaborators, options: RecoveryOptions) -> Self {
        Self {
            store,
            collaborators,
            options,
        }
    }

    pub fn options(&self) -> &RecoveryOptions {
        &self.options
    }

    /// 收集当前状态；不修改任何协作方。某个领域读取失败时记录在 `capture_errors` 中
    pub async fn capture_context(&self) -> ContextState {
        let c = &self.collaborators;
        let (memory, tasks, agents, tests) = tokio::join!(
            c.memory.list_all(),
            c.planning.list_all(),
            c.agents.list_history(),
            c.tdd.list_history(),
        );

        let mut state = ContextState {
            captured_at: Some(Utc::now()),
            ..ContextState::default()
        };
        match memory {
            Ok(entries) => state.memory = entries,
            Err(e) => record_capture_error(&mut state, SnapshotDomain::Memory, e),
        }
        match tasks {
            Ok(tasks) => state.tasks = tasks,
            Err(e) => record_capture_error(&mut state, SnapshotDomain::Planning, e),
        }
        match agents {
            Ok(history) => state.agents = history.iter().map(AgentExecutionRef::from).collect(),
            Err(e) => record_capture_error(&mut state, SnapshotDomain::Agents, e),
        }
        match tests {
            Ok(runs) => state.test_runs = runs.iter().map(TestRunRef::from).collect(),
            Err(e) => record_capture_error(&mut state, SnapshotDomain::Tdd, e),
        }

        tracing::debug!(
            memory = state.memory.len(),
            tasks = state.tasks.len(),
            agents = state.agents.len(),
            test_runs = state.test_runs.len(),
            "Context captured"
        );
        state
    }

    /// 保存快照，返回快照 ID。每次调用都新增一行
    pub async fn save_context(
        &self,
        session_id: &str,
        state: &ContextState,
        metadata: SnapshotMetadata,
    ) -> FusionResult<String> {
        let mut metadata = metadata;
        metadata.domain_errors.clear();
        metadata.counts.clear();
        let mut blocks = DomainBlocks::default();

        for domain in [
            SnapshotDomain::Memory,
            SnapshotDomain::Planning,
            SnapshotDomain::Agents,
            SnapshotDomain::Tdd,
        ] {
            if let Some(e) = state.capture_errors.get(&domain) {
                metadata.domain_errors.insert(domain, format!("capture failed: {e}"));
                continue;
            }
            let encoded = match domain {
                SnapshotDomain::Memory => self.encode_block(domain, &state.memory),
                SnapshotDomain::Planning => self.encode_block(domain, &state.tasks),
                SnapshotDomain::Agents => self.encode_block(domain, &state.agents),
                SnapshotDomain::Tdd => self.encode_block(domain, &state.test_runs),
                SnapshotDomain::Science => continue,
            };
            match encoded {
                Ok(block) => {
                    blocks.set(domain, Some(block));
                    metadata.counts.insert(domain, state.count(domain));
                }
                Err(e) => {
                    tracing::warn!(session_id, domain = %domain, "Block not saved: {}", e);
                    metadata.domain_errors.insert(domain, e.to_string());
                }
            }
        }
        metadata.partial = !metadata.domain_errors.is_empty();

        let snapshot = ContextSnapshot::new(session_id, blocks, metadata);
        self.store.insert(&snapshot).await?;
        tracing::info!(
            session_id,
            snapshot_id = %snapshot.id,
            partial = snapshot.metadata.partial,
            "Context snapshot saved"
        );
        Ok(snapshot.id)
    }

    pub async fn capture_and_save(&self, session_id: &str, metadata: SnapshotMetadata) -> FusionResult<String> {
        let state = self.capture_context().await;
        self.save_context(session_id, &state, metadata).await
    }

    fn encode_block<T: Serialize + ?Sized>(&self, domain: SnapshotDomain, items: &T) -> FusionResult<String> {
        let block = serde_json::to_string(items)?;
        if block.len() > self.options.max_block_bytes {
            return Err(FusionError::BlockTooLarge {
                domain: domain.to_string(),
                size: block.len(),
                limit: self.options.max_block_bytes,
            });
        }
        Ok(block)
    }

    /// 恢复会话：默认使用最新快照，也可指定快照 ID
    ///
    /// 会话或快照不存在时返回错误；领域级失败写入报告，不返回错误。
    pub async fn restore_context(
        &self,
        session_id: &str,
        snapshot_id: Option<&str>,
    ) -> FusionResult<RestorationReport> {
        let snapshot = match snapshot_id {
            Some(id) => self
                .store
                .get(id)
                .await?
                .filter(|s| s.session_id == session_id)
                .ok_or_else(|| FusionError::SnapshotNotFound(id.to_string()))?,
            None => self
                .store
                .latest_for_session(session_id)
                .await?
                .ok_or_else(|| FusionError::SessionNotFound(session_id.to_string()))?,
        };

        let mut report = RestorationReport::new(&snapshot);
        tracing::info!(session_id, snapshot_id = %snapshot.id, "Restoring context");

        if let Some(entries) = decode_block::<MemoryEntry>(&snapshot, SnapshotDomain::Memory, &mut report) {
            self.restore_memory(entries, &mut report).await;
        }
        if let Some(tasks) = decode_block::<TaskRecord>(&snapshot, SnapshotDomain::Planning, &mut report) {
            self.restore_tasks(&tasks, &mut report).await;
        }
        if let Some(agents) = decode_block::<AgentExecutionRef>(&snapshot, SnapshotDomain::Agents, &mut report) {
            report.agents = agents;
        }
        if let Some(runs) = decode_block::<TestRunRef>(&snapshot, SnapshotDomain::Tdd, &mut report) {
            report.test_runs = runs;
        }

        report.finish();
        tracing::info!(
            session_id,
            success = report.success,
            memory = report.memory_restored,
            tasks = report.tasks_restored,
            "Context restore finished"
        );
        Ok(report)
    }

    async fn restore_memory(&self, entries: Vec<MemoryEntry>, report: &mut RestorationReport) {
        let total = entries.len();
        let mut first_error = None;
        for entry in entries {
            match self.collaborators.memory.create(entry).await {
                Ok(_) => report.memory_restored += 1,
                Err(e) => {
                    first_error.get_or_insert_with(|| FusionError::collaborator(e).to_string());
                }
            }
        }
        if let Some(e) = first_error {
            let failed = total - report.memory_restored;
            report.fail_domain(
                SnapshotDomain::Memory,
                format!("{failed} of {total} entries failed, first error: {e}"),
            );
        }
    }

    async fn restore_tasks(&self, tasks: &[TaskRecord], report: &mut RestorationReport) {
        let graph = TaskGraph::new(tasks);
        let order = match graph.topological_order() {
            Ok(order) => order,
            Err(e) => {
                report.fail_domain(SnapshotDomain::Planning, e);
                return;
            }
        };

        let mut ids = RestoredIdMap::new();
        let mut first_error = None;
        for i in order {
            let task = &tasks[i];
            // 父任务未能重建时丢弃引用，当前任务成为根
            let parent = task.parent_id.as_deref().and_then(|p| ids.resolve(p)).map(str::to_string);
            if graph.has_parent_in_set(i) && parent.is_none() {
                tracing::debug!(task_id = %task.id, "Parent not restored, task becomes a root");
            }
            match self
                .collaborators
                .planning
                .create(task.to_new_task(), parent.as_deref())
                .await
            {
                Ok(new_id) => {
                    ids.insert(task.id.clone(), new_id);
                    report.tasks_restored += 1;
                }
                Err(e) => {
                    first_error.get_or_insert_with(|| FusionError::collaborator(e).to_string());
                }
            }
        }
        if let Some(e) = first_error {
            let failed = tasks.len() - report.tasks_restored;
            report.fail_domain(
                SnapshotDomain::Planning,
                format!("{failed} of {} tasks failed, first error: {e}", tasks.len()),
            );
        }
    }

    /// 可恢复会话列表（最新在前）
    pub async fn get_available_sessions(&self, filter: SessionFilter) -> FusionResult<Vec<SessionSummary>> {
        self.store.list_sessions(&filter).await
    }

    /// 删除会话的全部快照；会话不存在时返回 SessionNotFound
    pub async fn delete_session(&self, session_id: &str) -> FusionResult<usize> {
        let deleted = self.store.delete_session(session_id).await?;
        if deleted == 0 {
            return Err(FusionError::SessionNotFound(session_id.to_string()));
        }
        tracing::info!(session_id, deleted, "Session snapshots deleted");
        Ok(deleted)
    }

    pub async fn get_statistics(&self) -> FusionResult<RecoveryStatistics> {
        self.store.statistics().await
    }

    /// 注册 session-end / session-start / context-full 三个处理器，返回注册 ID
    pub async fn register_hooks(self: &Arc<Self>, registry: &HookRegistry) -> Vec<RegistrationId> {
        let priority = self.options.hook_priority;
        vec![
            registry
                .register(
                    HookEventKind::SessionEnd,
                    Arc::new(CheckpointHandler {
                        manager: Arc::clone(self),
                        checkpoint: CheckpointKind::SessionEnd,
                    }),
                    priority,
                    "recovery: save context at session end",
                )
                .await,
            registry
                .register(
                    HookEventKind::SessionStart,
                    Arc::new(SessionStartHandler {
                        manager: Arc::clone(self),
                    }),
                    priority,
                    "recovery: list restorable sessions",
                )
                .await,
            registry
                .register(
                    HookEventKind::ContextFull,
                    Arc::new(CheckpointHandler {
                        manager: Arc::clone(self),
                        checkpoint: CheckpointKind::ContextFull,
                    }),
                    priority,
                    "recovery: checkpoint before context compression",
                )
                .await,
        ]
    }
}

fn record_capture_error(state: &mut ContextState, domain: SnapshotDomain, err: anyhow::Error) {
    let err = FusionError::collaborator(err);
    tracing::warn!(domain = %domain, "Capture failed: {}", err);
    state.capture_errors.insert(domain, err.to_string());
}

/// 解析区块；未写入的记为 missing，解析失败记为该领域的数据完整性错误
fn decode_block<T: DeserializeOwned>(
    snapshot: &ContextSnapshot,
    domain: SnapshotDomain,
    report: &mut RestorationReport,
) -> Option<Vec<T>> {
    let Some(block) = snapshot.blocks.get(domain) else {
        if snapshot.metadata.domain_errors.contains_key(&domain) {
            report.missing_domains.push(domain);
        }
        return None;
    };
    match serde_json::from_str(block) {
        Ok(items) => Some(items),
        Err(e) => {
            report.fail_domain(
                domain,
                FusionError::DataIntegrity(format!("{domain} block is unreadable: {e}")),
            );
            None
        }
    }
}

/// 从事件数据中取出 user / project / description
fn metadata_from_event(event: &HookEvent) -> SnapshotMetadata {
    SnapshotMetadata {
        user: event.get_str("user").map(str::to_string),
        project: event.get_str("project").map(str::to_string),
        description: event.get_str("description").map(str::to_string),
        ..SnapshotMetadata::default()
    }
}

fn require_session_id(event: &HookEvent) -> Result<&str, HookError> {
    event
        .session_id()
        .ok_or_else(|| HookError::failed(format!("{} event carries no session id", event.kind)))
}

/// session-end / context-full：捕获并保存
struct CheckpointHandler {
    manager: Arc<ContextRecoveryManager>,
    checkpoint: CheckpointKind,
}

#[async_trait]
impl HookHandler for CheckpointHandler {
    async fn handle(&self, event: &HookEvent, scratch: &mut HookScratch) -> Result<(), HookError> {
        let session_id = require_session_id(event)?;
        let metadata = metadata_from_event(event).with_checkpoint(self.checkpoint);
        let snapshot_id = self.manager.capture_and_save(session_id, metadata).await?;
        scratch.insert(SCRATCH_SNAPSHOT_ID.to_string(), Value::String(snapshot_id));
        Ok(())
    }
}

/// session-start：列出可恢复会话，不自动恢复
struct SessionStartHandler {
    manager: Arc<ContextRecoveryManager>,
}

#[async_trait]
impl HookHandler for SessionStartHandler {
    async fn handle(&self, _event: &HookEvent, scratch: &mut HookScratch) -> Result<(), HookError> {
        let filter = SessionFilter::default().limit(self.manager.options.session_list_limit);
        let sessions = self.manager.get_available_sessions(filter).await?;
        if !sessions.is_empty() {
            tracing::info!("{} restorable session(s) available", sessions.len());
        }
        let value = serde_json::to_value(&sessions).map_err(FusionError::from)?;
        scratch.insert(SCRATCH_AVAILABLE_SESSIONS.to_string(), value);
        Ok(())
    }
}
