//! Fusion 构建器：统一的初始化与关闭逻辑
//!
//! 进程内只构造一个 [`HookRegistry`]，显式注入给恢复管理器与工作流编排器；
//! 关闭时先结束当前会话（触发 session-end 保存快照），再清空注册表。

use std::path::PathBuf;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::RwLock;

use crate::collaborators::Collaborators;
use crate::config::FusionConfig;
use crate::dashboard::DashboardAggregator;
use crate::hooks::{DispatchReport, HookEvent, HookEventKind, HookRegistry};
use crate::recovery::{create_snapshot_store, ContextRecoveryManager, SnapshotStore};
use crate::workflow::WorkflowOrchestrator;

/// Fusion 构建器
pub struct FusionBuilder {
    config: FusionConfig,
    collaborators: Option<Collaborators>,
    store: Option<Arc<dyn SnapshotStore>>,
}

impl FusionBuilder {
    pub fn new(config: FusionConfig) -> Self {
        Self {
            config,
            collaborators: None,
            store: None,
        }
    }

    /// 从默认路径加载配置；加载失败时使用默认配置
    pub fn from_config_path(config_path: Option<PathBuf>) -> Self {
        let config = crate::config::load_config(config_path).unwrap_or_else(|e| {
            tracing::warn!("Config load failed ({}), using defaults", e);
            FusionConfig::default()
        });
        Self::new(config)
    }

    /// 接入真实协作方；未设置时全部使用进程内实现
    pub fn with_collaborators(mut self, collaborators: Collaborators) -> Self {
        self.collaborators = Some(collaborators);
        self
    }

    /// 指定快照存储；未设置时按 recovery.db_path 创建
    pub fn with_snapshot_store(mut self, store: Arc<dyn SnapshotStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn config(&self) -> &FusionConfig {
        &self.config
    }

    /// 构建全部组件并注册恢复处理器
    pub async fn build(self) -> Fusion {
        let config = self.config;
        let registry = Arc::new(HookRegistry::new().with_handler_timeout(config.hooks.handler_timeout()));
        let collaborators = self.collaborators.unwrap_or_else(Collaborators::in_memory);
        let store = self
            .store
            .unwrap_or_else(|| create_snapshot_store(config.recovery.db_path.as_deref()));

        let recovery = Arc::new(ContextRecoveryManager::new(
            store,
            collaborators.clone(),
            config.recovery.options(),
        ));
        let ids = recovery.register_hooks(&registry).await;
        tracing::debug!("Registered {} recovery hooks", ids.len());

        let orchestrator = WorkflowOrchestrator::new(
            Arc::clone(&registry),
            collaborators.clone(),
            config.workflow.options(),
        );
        let dashboard = DashboardAggregator::new(collaborators.clone())
            .with_orchestrator(Arc::clone(&orchestrator));

        Fusion {
            registry,
            recovery,
            orchestrator,
            dashboard,
            collaborators,
            active_session: RwLock::new(None),
            config,
        }
    }
}

/// 预构建的 Fusion 组件：注册表、恢复管理器、编排器、汇总
pub struct Fusion {
    registry: Arc<HookRegistry>,
    recovery: Arc<ContextRecoveryManager>,
    orchestrator: Arc<WorkflowOrchestrator>,
    dashboard: DashboardAggregator,
    collaborators: Collaborators,
    active_session: RwLock<Option<String>>,
    config: FusionConfig,
}

impl Fusion {
    pub fn registry(&self) -> &Arc<HookRegistry> {
        &self.registry
    }

    pub fn recovery(&self) -> &Arc<ContextRecoveryManager> {
        &self.recovery
    }

    pub fn orchestrator(&self) -> &Arc<WorkflowOrchestrator> {
        &self.orchestrator
    }

    pub fn dashboard(&self) -> &DashboardAggregator {
        &self.dashboard
    }

    pub fn collaborators(&self) -> &Collaborators {
        &self.collaborators
    }

    pub fn config(&self) -> &FusionConfig {
        &self.config
    }

    pub async fn active_session(&self) -> Option<String> {
        self.active_session.read().await.clone()
    }

    /// 开始会话：记录当前会话并触发 session-start（恢复处理器会列出可恢复的会话）
    pub async fn start_session(&self, session_id: impl Into<String>, data: Value) -> DispatchReport {
        let session_id = session_id.into();
        let previous = self.active_session.write().await.replace(session_id.clone());
        if let Some(previous) = previous.filter(|p| *p != session_id) {
            tracing::warn!("Session {} replaced by {} without session-end", previous, session_id);
        }
        tracing::info!(session_id = %session_id, "Session started");
        let event = HookEvent::with_data(HookEventKind::SessionStart, data)
            .correlated(session_id.clone())
            .with("session_id", session_id);
        self.registry.fire(event).await
    }

    /// 结束当前会话并触发 session-end；没有活动会话时返回 None
    pub async fn end_session(&self) -> Option<DispatchReport> {
        let session_id = self.active_session.write().await.take()?;
        tracing::info!(session_id = %session_id, "Session ended");
        let event = HookEvent::new(HookEventKind::SessionEnd)
            .correlated(session_id.clone())
            .with("session_id", session_id);
        Some(self.registry.fire(event).await)
    }

    /// 关闭：结束活动会话，然后清空注册表
    pub async fn shutdown(&self) -> Option<DispatchReport> {
        let report = self.end_session().await;
        if let Some(report) = &report {
            for (description, error) in report.errors() {
                tracing::warn!("Shutdown hook '{}' failed: {}", description, error);
            }
        }
        self.registry.clear().await;
        tracing::info!("Fusion shut down");
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recovery::{MemorySnapshotStore, SCRATCH_AVAILABLE_SESSIONS};
    use serde_json::json;

    async fn build() -> Fusion {
        FusionBuilder::new(FusionConfig::default())
            .with_snapshot_store(Arc::new(MemorySnapshotStore::new()))
            .build()
            .await
    }

    #[tokio::test]
    async fn test_build_registers_recovery_hooks() {
        let fusion = build().await;
        for kind in [
            HookEventKind::SessionStart,
            HookEventKind::SessionEnd,
            HookEventKind::ContextFull,
        ] {
            let hooks = fusion.registry().list(kind).await;
            assert_eq!(hooks.len(), 1);
            assert_eq!(hooks[0].priority, 1000);
        }
    }

    #[tokio::test]
    async fn test_session_lifecycle_saves_snapshot() {
        let fusion = build().await;
        let report = fusion.start_session("s1", json!({ "user": "ana" })).await;
        assert!(report.is_success());
        assert_eq!(fusion.active_session().await.as_deref(), Some("s1"));

        let report = fusion.end_session().await.unwrap();
        assert!(report.is_success());
        assert!(fusion.active_session().await.is_none());
        assert!(fusion.end_session().await.is_none());

        let stats = fusion.recovery().get_statistics().await.unwrap();
        assert_eq!(stats.total_snapshots, 1);
    }

    #[tokio::test]
    async fn test_shutdown_ends_session_and_clears_registry() {
        let fusion = build().await;
        fusion.start_session("s1", Value::Null).await;
        let report = fusion.shutdown().await.unwrap();
        assert_eq!(report.succeeded, 1);
        assert!(fusion.registry().is_empty().await);
        assert_eq!(fusion.recovery().get_statistics().await.unwrap().distinct_sessions, 1);
    }

    #[tokio::test]
    async fn test_start_session_lists_previous_sessions() {
        let fusion = build().await;
        fusion.start_session("s1", Value::Null).await;
        fusion.end_session().await;

        // 草稿区在分发结束后丢弃，通过低优先级观察者读取
        let listed = Arc::new(std::sync::Mutex::new(Value::Null));
        let listed_clone = listed.clone();
        fusion
            .registry()
            .register(
                HookEventKind::SessionStart,
                crate::hooks::hook_fn(move |_, scratch| {
                    *listed_clone.lock().unwrap() =
                        scratch.get(SCRATCH_AVAILABLE_SESSIONS).cloned().unwrap_or_default();
                    Ok(())
                }),
                0,
                "observer",
            )
            .await;
        fusion.start_session("s2", Value::Null).await;
        assert_eq!(listed.lock().unwrap()[0]["session_id"], "s1");
    }
}
