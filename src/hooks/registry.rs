//! 钩子注册表：按事件类型保存有序处理器列表，并按优先级分发事件
//!
//! - 优先级数值越大越先执行，同优先级按注册顺序（稳定）
//! - 单个处理器失败/超时只记入报告，不影响后续处理器
//! - 分发开始时对处理器列表取快照：处理器内部注册的新处理器不会在本次分发中执行
//! - 一次性续接按 (事件类型, 关联 ID) 存放，被取出执行后立即删除

use std::cmp::Reverse;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::RwLock;

use crate::core::FusionResult;
use crate::hooks::event::{HookError, HookEvent, HookEventKind, HookScratch};
use crate::hooks::handler::HookHandler;

/// 注册 ID（单调递增，同时充当注册顺序）
pub type RegistrationId = u64;

/// fire_named 从事件数据中读取关联 ID 的键（按顺序）
const CORRELATION_KEYS: [&str; 3] = ["correlation_id", "task_id", "session_id"];

#[derive(Clone)]
struct HookEntry {
    id: RegistrationId,
    priority: i32,
    description: String,
    one_shot: bool,
    handler: Arc<dyn HookHandler>,
}

#[derive(Default)]
struct RegistryTables {
    /// 每个事件类型的常驻处理器（已按执行顺序排列）
    hooks: HashMap<HookEventKind, Vec<HookEntry>>,
    /// 一次性续接：(事件类型, 关联 ID) -> 处理器
    continuations: HashMap<(HookEventKind, String), HookEntry>,
}

/// 注册信息（供 list 展示）
#[derive(Debug, Clone, Serialize)]
pub struct RegistrationInfo {
    pub id: RegistrationId,
    pub priority: i32,
    pub description: String,
    pub one_shot: bool,
    pub correlation_id: Option<String>,
}

/// 单个处理器的执行结果
#[derive(Debug, Clone, Serialize)]
pub struct HandlerOutcome {
    pub registration_id: RegistrationId,
    pub description: String,
    pub priority: i32,
    pub error: Option<String>,
}

impl HandlerOutcome {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// 一次分发的汇总报告
#[derive(Debug, Clone, Serialize)]
pub struct DispatchReport {
    pub kind: HookEventKind,
    pub correlation_id: Option<String>,
    pub succeeded: usize,
    pub failed: usize,
    /// 按执行顺序排列
    pub outcomes: Vec<HandlerOutcome>,
}

impl DispatchReport {
    fn new(kind: HookEventKind, correlation_id: Option<String>) -> Self {
        Self {
            kind,
            correlation_id,
            succeeded: 0,
            failed: 0,
            outcomes: Vec::new(),
        }
    }

    fn record(&mut self, entry: &HookEntry, result: Result<(), HookError>) {
        let error = match result {
            Ok(()) => {
                self.succeeded += 1;
                None
            }
            Err(e) => {
                self.failed += 1;
                Some(e.to_string())
            }
        };
        self.outcomes.push(HandlerOutcome {
            registration_id: entry.id,
            description: entry.description.clone(),
            priority: entry.priority,
            error,
        });
    }

    pub fn is_success(&self) -> bool {
        self.failed == 0
    }

    /// 没有任何处理器被执行
    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }

    /// (处理器描述, 错误信息)
    pub fn errors(&self) -> impl Iterator<Item = (&str, &str)> {
        self.outcomes
            .iter()
            .filter_map(|o| o.error.as_deref().map(|e| (o.description.as_str(), e)))
    }
}

/// 钩子注册表
///
/// 进程内只应构造一个实例，通过 `Arc` 注入给所有需要注册或触发事件的组件。
pub struct HookRegistry {
    tables: RwLock<RegistryTables>,
    next_id: AtomicU64,
    /// 单个处理器的等待上限；None 表示不限
    handler_timeout: Option<Duration>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(RegistryTables::default()),
            next_id: AtomicU64::new(1),
            handler_timeout: None,
        }
    }

    /// 设置单个处理器的超时；超时按处理器失败处理
    pub fn with_handler_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.handler_timeout = timeout.filter(|t| !t.is_zero());
        self
    }

    fn next_id(&self) -> RegistrationId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// 注册常驻处理器，返回注册 ID
    pub async fn register(
        &self,
        kind: HookEventKind,
        handler: Arc<dyn HookHandler>,
        priority: i32,
        description: impl Into<String>,
    ) -> RegistrationId {
        let entry = HookEntry {
            id: self.next_id(),
            priority,
            description: description.into(),
            one_shot: false,
            handler,
        };
        let id = entry.id;
        tracing::debug!(kind = %kind, id, priority, "Registering hook: {}", entry.description);

        let mut tables = self.tables.write().await;
        let list = tables.hooks.entry(kind).or_default();
        list.push(entry);
        list.sort_by_key(|e| (Reverse(e.priority), e.id));
        id
    }

    /// 注册一次性续接：只在 `kind` 事件携带相同 `correlation_id` 时执行一次
    ///
    /// 同一 (kind, correlation_id) 重复注册时覆盖旧的续接。
    pub async fn register_once(
        &self,
        kind: HookEventKind,
        correlation_id: impl Into<String>,
        handler: Arc<dyn HookHandler>,
        priority: i32,
        description: impl Into<String>,
    ) -> RegistrationId {
        let correlation_id = correlation_id.into();
        let entry = HookEntry {
            id: self.next_id(),
            priority,
            description: description.into(),
            one_shot: true,
            handler,
        };
        let id = entry.id;
        tracing::debug!(kind = %kind, id, correlation_id = %correlation_id, "Registering one-shot continuation");

        let mut tables = self.tables.write().await;
        if let Some(old) = tables.continuations.insert((kind, correlation_id), entry) {
            tracing::warn!(kind = %kind, replaced = old.id, "One-shot continuation replaced");
        }
        id
    }

    /// 注销处理器；不存在时什么也不做。返回是否确实移除了
    pub async fn unregister(&self, id: RegistrationId) -> bool {
        let mut tables = self.tables.write().await;
        let mut removed = false;
        for list in tables.hooks.values_mut() {
            let before = list.len();
            list.retain(|e| e.id != id);
            removed |= list.len() < before;
        }
        let before = tables.continuations.len();
        tables.continuations.retain(|_, e| e.id != id);
        removed |= tables.continuations.len() < before;
        removed
    }

    /// 列出某事件类型的常驻处理器（执行顺序）及其一次性续接
    pub async fn list(&self, kind: HookEventKind) -> Vec<RegistrationInfo> {
        let tables = self.tables.read().await;
        let mut infos: Vec<RegistrationInfo> = tables
            .hooks
            .get(&kind)
            .map(|list| {
                list.iter()
                    .map(|e| RegistrationInfo {
                        id: e.id,
                        priority: e.priority,
                        description: e.description.clone(),
                        one_shot: false,
                        correlation_id: None,
                    })
                    .collect()
            })
            .unwrap_or_default();
        infos.extend(
            tables
                .continuations
                .iter()
                .filter(|((k, _), _)| *k == kind)
                .map(|((_, cid), e)| RegistrationInfo {
                    id: e.id,
                    priority: e.priority,
                    description: e.description.clone(),
                    one_shot: e.one_shot,
                    correlation_id: Some(cid.clone()),
                }),
        );
        infos
    }

    /// 已注册处理器总数（含一次性续接）
    pub async fn len(&self) -> usize {
        let tables = self.tables.read().await;
        tables.hooks.values().map(Vec::len).sum::<usize>() + tables.continuations.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// 清空所有注册（进程关闭时调用）
    pub async fn clear(&self) {
        let mut tables = self.tables.write().await;
        tables.hooks.clear();
        tables.continuations.clear();
    }

    /// 触发事件：按优先级依次执行处理器，返回汇总报告，从不因处理器失败而返回错误
    pub async fn fire(&self, event: HookEvent) -> DispatchReport {
        let kind = event.kind;

        // 先取快照再执行，执行期间不持有锁，处理器内部可以继续注册/注销
        let mut matching: Vec<HookEntry> = {
            let mut tables = self.tables.write().await;
            let mut matching = tables.hooks.get(&kind).cloned().unwrap_or_default();
            if let Some(cid) = event.correlation_id.as_ref() {
                if let Some(entry) = tables.continuations.remove(&(kind, cid.clone())) {
                    matching.push(entry);
                }
            }
            matching
        };
        matching.sort_by_key(|e| (Reverse(e.priority), e.id));

        let mut report = DispatchReport::new(kind, event.correlation_id.clone());
        if matching.is_empty() {
            return report;
        }

        let mut scratch = HookScratch::new();
        for entry in &matching {
            tracing::debug!(kind = %kind, id = entry.id, "Running hook: {}", entry.description);
            let result = match self.handler_timeout {
                Some(timeout) => {
                    match tokio::time::timeout(timeout, entry.handler.handle(&event, &mut scratch))
                        .await
                    {
                        Ok(result) => result,
                        Err(_elapsed) => Err(HookError::Timeout { timeout }),
                    }
                }
                None => entry.handler.handle(&event, &mut scratch).await,
            };
            if let Err(e) = &result {
                tracing::warn!(kind = %kind, id = entry.id, "Hook '{}' failed: {}", entry.description, e);
            }
            report.record(entry, result);
        }

        report
    }

    /// 按名称触发事件（供类型系统之外的协作方使用）；未知名称返回配置错误
    ///
    /// 关联 ID 依次取自 data 中的 `correlation_id`、`task_id`、`session_id`。
    pub async fn fire_named(&self, name: &str, data: Value) -> FusionResult<DispatchReport> {
        let kind: HookEventKind = name.parse()?;
        let mut event = HookEvent::with_data(kind, data);
        let correlation_id = CORRELATION_KEYS
            .iter()
            .find_map(|key| event.get_str(key))
            .filter(|id| !id.is_empty())
            .map(str::to_string);
        if let Some(id) = correlation_id {
            event = event.correlated(id);
        }
        Ok(self.fire(event).await)
    }
}

impl Default for HookRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::FusionError;
    use crate::hooks::handler::hook_fn;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;

    /// 记录执行顺序的处理器
    fn recorder(log: Arc<Mutex<Vec<i32>>>, tag: i32) -> Arc<dyn HookHandler> {
        hook_fn(move |_event, _scratch| {
            log.lock().unwrap().push(tag);
            Ok(())
        })
    }

    fn failing(log: Arc<Mutex<Vec<i32>>>, tag: i32) -> Arc<dyn HookHandler> {
        hook_fn(move |_event, _scratch| {
            log.lock().unwrap().push(tag);
            Err(HookError::failed("boom"))
        })
    }

    /// 睡眠超过超时时间的处理器
    struct SlowHandler;

    #[async_trait]
    impl HookHandler for SlowHandler {
        async fn handle(&self, _event: &HookEvent, _scratch: &mut HookScratch) -> Result<(), HookError> {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok(())
        }
    }

    /// 执行时向同一事件类型再注册一个处理器
    struct SelfExtendingHandler {
        registry: Arc<HookRegistry>,
        log: Arc<Mutex<Vec<i32>>>,
    }

    #[async_trait]
    impl HookHandler for SelfExtendingHandler {
        async fn handle(&self, event: &HookEvent, _scratch: &mut HookScratch) -> Result<(), HookError> {
            self.log.lock().unwrap().push(1);
            self.registry
                .register(event.kind, recorder(self.log.clone(), 2), 0, "late")
                .await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_empty_registry_reports_nothing() {
        let registry = HookRegistry::new();
        let report = registry.fire(HookEvent::new(HookEventKind::SessionStart)).await;
        assert!(report.is_empty());
        assert!(report.is_success());
    }

    #[tokio::test]
    async fn test_priority_ordering_high_first() {
        let registry = HookRegistry::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        for p in [10, 100, 50] {
            registry
                .register(HookEventKind::AgentStarted, recorder(log.clone(), p), p, format!("p{p}"))
                .await;
        }

        let report = registry.fire(HookEvent::new(HookEventKind::AgentStarted)).await;
        assert_eq!(*log.lock().unwrap(), vec![100, 50, 10]);
        assert_eq!(report.succeeded, 3);
        let order: Vec<i32> = report.outcomes.iter().map(|o| o.priority).collect();
        assert_eq!(order, vec![100, 50, 10]);
    }

    #[tokio::test]
    async fn test_equal_priority_keeps_registration_order() {
        let registry = HookRegistry::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        for tag in 1..=4 {
            registry
                .register(HookEventKind::MemorySaved, recorder(log.clone(), tag), 5, "same")
                .await;
        }

        for _ in 0..2 {
            registry.fire(HookEvent::new(HookEventKind::MemorySaved)).await;
        }
        assert_eq!(*log.lock().unwrap(), vec![1, 2, 3, 4, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_failure_is_isolated() {
        let registry = HookRegistry::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        registry
            .register(HookEventKind::SessionEnd, failing(log.clone(), 100), 100, "broken")
            .await;
        registry
            .register(HookEventKind::SessionEnd, recorder(log.clone(), 50), 50, "fifty")
            .await;
        registry
            .register(HookEventKind::SessionEnd, recorder(log.clone(), 10), 10, "ten")
            .await;

        let report = registry.fire(HookEvent::new(HookEventKind::SessionEnd)).await;
        assert_eq!(*log.lock().unwrap(), vec![100, 50, 10]);
        assert_eq!(report.failed, 1);
        assert_eq!(report.succeeded, 2);
        let errors: Vec<_> = report.errors().collect();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].0, "broken");
        assert!(errors[0].1.contains("boom"));
    }

    #[tokio::test]
    async fn test_scratch_is_shared_within_one_dispatch() {
        let registry = HookRegistry::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        registry
            .register(
                HookEventKind::ProgressUpdate,
                hook_fn(|_e, scratch| {
                    scratch.insert("step".into(), json!(1));
                    Ok(())
                }),
                10,
                "writer",
            )
            .await;
        let seen_clone = seen.clone();
        registry
            .register(
                HookEventKind::ProgressUpdate,
                hook_fn(move |_e, scratch| {
                    seen_clone.lock().unwrap().push(scratch.get("step").cloned());
                    Ok(())
                }),
                1,
                "reader",
            )
            .await;

        registry.fire(HookEvent::new(HookEventKind::ProgressUpdate)).await;
        registry.fire(HookEvent::new(HookEventKind::ProgressUpdate)).await;
        assert_eq!(*seen.lock().unwrap(), vec![Some(json!(1)), Some(json!(1))]);
    }

    #[tokio::test]
    async fn test_scratch_does_not_leak_between_dispatches() {
        let registry = HookRegistry::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        registry
            .register(
                HookEventKind::Custom,
                hook_fn(move |_e, scratch| {
                    seen_clone.lock().unwrap().push(scratch.contains_key("mark"));
                    scratch.insert("mark".into(), json!(true));
                    Ok(())
                }),
                0,
                "marker",
            )
            .await;

        registry.fire(HookEvent::new(HookEventKind::Custom)).await;
        registry.fire(HookEvent::new(HookEventKind::Custom)).await;
        assert_eq!(*seen.lock().unwrap(), vec![false, false]);
    }

    #[tokio::test]
    async fn test_handlers_added_during_dispatch_wait_for_next_fire() {
        let registry = Arc::new(HookRegistry::new());
        let log = Arc::new(Mutex::new(Vec::new()));
        registry
            .register(
                HookEventKind::PlanningCompleted,
                Arc::new(SelfExtendingHandler {
                    registry: registry.clone(),
                    log: log.clone(),
                }),
                10,
                "extender",
            )
            .await;

        let report = registry.fire(HookEvent::new(HookEventKind::PlanningCompleted)).await;
        assert_eq!(report.succeeded, 1);
        assert_eq!(*log.lock().unwrap(), vec![1]);

        let report = registry.fire(HookEvent::new(HookEventKind::PlanningCompleted)).await;
        assert_eq!(report.succeeded, 2);
        assert_eq!(*log.lock().unwrap(), vec![1, 1, 2]);
    }

    #[tokio::test]
    async fn test_unregister_is_idempotent() {
        let registry = HookRegistry::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let id = registry
            .register(HookEventKind::MemoryRecalled, recorder(log.clone(), 1), 0, "r")
            .await;

        assert!(registry.unregister(id).await);
        assert!(!registry.unregister(id).await);
        assert!(!registry.unregister(9999).await);

        let report = registry.fire(HookEvent::new(HookEventKind::MemoryRecalled)).await;
        assert!(report.is_empty());
        assert!(log.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_kinds_are_isolated() {
        let registry = HookRegistry::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        registry
            .register(HookEventKind::PreToolUse, recorder(log.clone(), 1), 0, "pre")
            .await;

        let report = registry.fire(HookEvent::new(HookEventKind::PostToolUse)).await;
        assert!(report.is_empty());
        assert!(log.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_one_shot_continuation_matches_correlation_once() {
        let registry = HookRegistry::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        registry
            .register_once(HookEventKind::AgentCompleted, "task-1", recorder(log.clone(), 1), 0, "cont")
            .await;

        // 其他运行的完成事件不会触发
        registry
            .fire(HookEvent::new(HookEventKind::AgentCompleted).correlated("task-2"))
            .await;
        registry.fire(HookEvent::new(HookEventKind::AgentCompleted)).await;
        assert!(log.lock().unwrap().is_empty());

        let report = registry
            .fire(HookEvent::new(HookEventKind::AgentCompleted).correlated("task-1"))
            .await;
        assert_eq!(report.succeeded, 1);

        let report = registry
            .fire(HookEvent::new(HookEventKind::AgentCompleted).correlated("task-1"))
            .await;
        assert!(report.is_empty());
        assert_eq!(*log.lock().unwrap(), vec![1]);
    }

    #[tokio::test]
    async fn test_continuation_runs_in_priority_order_with_regular_hooks() {
        let registry = HookRegistry::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        registry
            .register(HookEventKind::TddCycleCompleted, recorder(log.clone(), 100), 100, "high")
            .await;
        registry
            .register(HookEventKind::TddCycleCompleted, recorder(log.clone(), 10), 10, "low")
            .await;
        registry
            .register_once(HookEventKind::TddCycleCompleted, "t", recorder(log.clone(), 50), 50, "cont")
            .await;

        registry
            .fire(HookEvent::new(HookEventKind::TddCycleCompleted).correlated("t"))
            .await;
        assert_eq!(*log.lock().unwrap(), vec![100, 50, 10]);
    }

    #[tokio::test]
    async fn test_unregister_removes_continuation() {
        let registry = HookRegistry::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let id = registry
            .register_once(HookEventKind::AgentCompleted, "task-1", recorder(log.clone(), 1), 0, "cont")
            .await;
        assert_eq!(registry.len().await, 1);
        assert!(registry.unregister(id).await);
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_timeout_counts_as_failure() {
        let registry = HookRegistry::new().with_handler_timeout(Some(Duration::from_millis(50)));
        let log = Arc::new(Mutex::new(Vec::new()));
        registry
            .register(HookEventKind::ContextFull, Arc::new(SlowHandler), 10, "slow")
            .await;
        registry
            .register(HookEventKind::ContextFull, recorder(log.clone(), 1), 1, "after")
            .await;

        let report = registry.fire(HookEvent::new(HookEventKind::ContextFull)).await;
        assert_eq!(report.failed, 1);
        assert_eq!(report.succeeded, 1);
        assert!(report.outcomes[0].error.as_deref().unwrap().contains("timed out"));
        assert_eq!(*log.lock().unwrap(), vec![1]);
    }

    #[tokio::test]
    async fn test_fire_named_rejects_unknown_kind() {
        let registry = HookRegistry::new();
        let err = registry.fire_named("session-paused", json!({})).await.unwrap_err();
        assert!(matches!(err, FusionError::UnknownEventKind(_)));

        let report = registry.fire_named("session-start", json!({"session_id": "s"})).await.unwrap();
        assert_eq!(report.kind, HookEventKind::SessionStart);
        assert_eq!(report.correlation_id.as_deref(), Some("s"));
    }

    #[tokio::test]
    async fn test_fire_named_resumes_continuation() {
        let registry = HookRegistry::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        registry
            .register_once(HookEventKind::AgentCompleted, "task-1", recorder(log.clone(), 1), 0, "by task")
            .await;
        registry
            .register_once(HookEventKind::AgentCompleted, "corr-9", recorder(log.clone(), 2), 0, "explicit")
            .await;

        let report = registry
            .fire_named("agent-completed", json!({ "task_id": "task-1", "success": true }))
            .await
            .unwrap();
        assert_eq!(report.succeeded, 1);

        // 显式 correlation_id 优先于 task_id
        let report = registry
            .fire_named(
                "agent-completed",
                json!({ "correlation_id": "corr-9", "task_id": "task-1" }),
            )
            .await
            .unwrap();
        assert_eq!(report.correlation_id.as_deref(), Some("corr-9"));
        assert_eq!(*log.lock().unwrap(), vec![1, 2]);
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_list_and_clear() {
        let registry = HookRegistry::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        registry
            .register(HookEventKind::SessionStart, recorder(log.clone(), 1), 1, "one")
            .await;
        registry
            .register(HookEventKind::SessionStart, recorder(log.clone(), 2), 2, "two")
            .await;
        registry
            .register_once(HookEventKind::SessionStart, "s", recorder(log.clone(), 3), 0, "once")
            .await;

        let infos = registry.list(HookEventKind::SessionStart).await;
        let names: Vec<&str> = infos.iter().map(|i| i.description.as_str()).collect();
        assert_eq!(names, vec!["two", "one", "once"]);
        assert!(infos[2].one_shot);
        assert_eq!(infos[2].correlation_id.as_deref(), Some("s"));

        registry.clear().await;
        assert!(registry.is_empty().await);
    }
}
