//! Fusion 错误类型
//!
//! 分四类：配置错误（未知事件、会话无快照）、数据完整性错误（父子引用成环、区块无法解析）、
//! 协作方错误（外部子系统调用失败）、存储错误（SQLite / 序列化）。
//! 处理器内部的错误不会越过 `HookRegistry::fire` 的边界，只会以报告条目的形式出现。

use thiserror::Error;

/// 协调层对外暴露的错误
#[derive(Error, Debug)]
pub enum FusionError {
    /// 触发了未识别的事件类型
    #[error("Unknown hook event kind: {0}")]
    UnknownEventKind(String),

    /// 该会话没有任何快照
    #[error("No snapshot found for session: {0}")]
    SessionNotFound(String),

    #[error("Snapshot not found: {0}")]
    SnapshotNotFound(String),

    /// 快照数据不一致：父子引用成环、区块解析失败、重复 ID
    #[error("Data integrity error: {0}")]
    DataIntegrity(String),

    #[error("Block for domain '{domain}' is {size} bytes, limit is {limit}")]
    BlockTooLarge {
        domain: String,
        size: usize,
        limit: usize,
    },

    /// 工作流参数无效（如开启自动测试但未提供测试路径）
    #[error("Invalid workflow configuration: {0}")]
    InvalidWorkflow(String),

    #[error("Collaborator error: {0}")]
    Collaborator(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Config error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl From<rusqlite::Error> for FusionError {
    fn from(e: rusqlite::Error) -> Self {
        FusionError::Storage(e.to_string())
    }
}

impl FusionError {
    /// 将协作方返回的 anyhow 错误（含 context 链）转为 Collaborator
    pub fn collaborator(err: anyhow::Error) -> Self {
        FusionError::Collaborator(format!("{err:#}"))
    }

    /// 配置类错误：直接返回调用方，不重试
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            FusionError::UnknownEventKind(_)
                | FusionError::SessionNotFound(_)
                | FusionError::SnapshotNotFound(_)
                | FusionError::InvalidWorkflow(_)
                | FusionError::Config(_)
        )
    }

    pub fn is_data_integrity(&self) -> bool {
        matches!(self, FusionError::DataIntegrity(_))
    }
}

pub type FusionResult<T> = Result<T, FusionError>;
