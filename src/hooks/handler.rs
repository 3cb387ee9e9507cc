//! 处理器 trait：注册表只负责调用，不关心内部实现

use async_trait::async_trait;

use crate::hooks::event::{HookError, HookEvent, HookScratch};

/// 事件处理器：接收事件与草稿区，可挂起等待 I/O，返回成功或失败
///
/// 草稿区只在本次分发内有效，写入的键对同一次分发中后续（低优先级）的处理器可见。
#[async_trait]
pub trait HookHandler: Send + Sync {
    async fn handle(&self, event: &HookEvent, scratch: &mut HookScratch) -> Result<(), HookError>;
}

/// 同步闭包处理器（日志、计数等轻量观察者）
pub struct FnHandler<F> {
    f: F,
}

impl<F> FnHandler<F>
where
    F: Fn(&HookEvent, &mut HookScratch) -> Result<(), HookError> + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F> HookHandler for FnHandler<F>
where
    F: Fn(&HookEvent, &mut HookScratch) -> Result<(), HookError> + Send + Sync,
{
    async fn handle(&self, event: &HookEvent, scratch: &mut HookScratch) -> Result<(), HookError> {
        (self.f)(event, scratch)
    }
}

/// 便捷函数：把闭包包装成可注册的处理器
pub fn hook_fn<F>(f: F) -> std::sync::Arc<dyn HookHandler>
where
    F: Fn(&HookEvent, &mut HookScratch) -> Result<(), HookError> + Send + Sync + 'static,
{
    std::sync::Arc::new(FnHandler::new(f))
}
