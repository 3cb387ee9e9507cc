//! 可观测性：tracing 订阅器初始化
//!
//! 日志级别由 `RUST_LOG` 控制，未设置时为 info。

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

/// 安装全局订阅器；已安装时 panic
pub fn init() {
    tracing_subscriber::registry()
        .with(env_filter())
        .with(fmt::layer())
        .init();
}

/// 安装全局订阅器；已安装时返回错误（测试与嵌入场景使用）
pub fn try_init() -> Result<(), tracing_subscriber::util::TryInitError> {
    tracing_subscriber::registry()
        .with(env_filter())
        .with(fmt::layer())
        .try_init()
}
