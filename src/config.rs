//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `FUSION__*` 覆盖（双下划线表示嵌套，如 `FUSION__RECOVERY__DB_PATH=data/snapshots.db`）。

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::recovery::{RecoveryOptions, RECOVERY_HOOK_PRIORITY};
use crate::workflow::{OrchestratorOptions, WORKFLOW_HOOK_PRIORITY};

/// 配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct FusionConfig {
    pub hooks: HooksSection,
    pub recovery: RecoverySection,
    pub workflow: WorkflowSection,
}

/// [hooks] 段：处理器超时
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HooksSection {
    /// 单个处理器的等待上限（秒），0 表示不限
    pub handler_timeout_secs: u64,
}

impl Default for HooksSection {
    fn default() -> Self {
        Self {
            handler_timeout_secs: 30,
        }
    }
}

impl HooksSection {
    pub fn handler_timeout(&self) -> Option<Duration> {
        (self.handler_timeout_secs > 0).then(|| Duration::from_secs(self.handler_timeout_secs))
    }
}

/// [recovery] 段：快照数据库与恢复处理器
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RecoverySection {
    /// SQLite 文件路径；未设置时快照只保存在内存中
    pub db_path: Option<PathBuf>,
    pub hook_priority: i32,
    /// session-start 时列出的会话数
    pub session_list_limit: usize,
    /// 单个领域区块上限（字节），超出的区块不写入，快照标记为 partial
    pub max_block_bytes: usize,
}

impl Default for RecoverySection {
    fn default() -> Self {
        let options = RecoveryOptions::default();
        Self {
            db_path: None,
            hook_priority: RECOVERY_HOOK_PRIORITY,
            session_list_limit: options.session_list_limit,
            max_block_bytes: options.max_block_bytes,
        }
    }
}

impl RecoverySection {
    pub fn options(&self) -> RecoveryOptions {
        RecoveryOptions {
            hook_priority: self.hook_priority,
            session_list_limit: self.session_list_limit,
            max_block_bytes: self.max_block_bytes,
        }
    }
}

/// [workflow] 段：运行保留数、记忆分类与协作方调用超时
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkflowSection {
    pub hook_priority: i32,
    pub max_retained_runs: usize,
    pub memory_category: String,
    /// 单次协作方调用的等待上限（秒），0 表示不限
    pub collaborator_timeout_secs: u64,
}

impl Default for WorkflowSection {
    fn default() -> Self {
        let options = OrchestratorOptions::default();
        Self {
            hook_priority: WORKFLOW_HOOK_PRIORITY,
            max_retained_runs: options.max_retained_runs,
            memory_category: options.memory_category,
            collaborator_timeout_secs: options.collaborator_timeout.map_or(0, |t| t.as_secs()),
        }
    }
}

impl WorkflowSection {
    pub fn options(&self) -> OrchestratorOptions {
        OrchestratorOptions {
            hook_priority: self.hook_priority,
            max_retained_runs: self.max_retained_runs,
            memory_category: self.memory_category.clone(),
            collaborator_timeout: (self.collaborator_timeout_secs > 0)
                .then(|| Duration::from_secs(self.collaborator_timeout_secs)),
        }
    }
}

/// 从 config 目录加载配置，环境变量 FUSION__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 FUSION__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<FusionConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("FUSION")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}
