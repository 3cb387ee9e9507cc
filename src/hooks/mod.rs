//! 钩子引擎：子系统通过它宣告生命周期事件，处理器按优先级依次响应
//!
//! 事件类型见 [`HookEventKind`]；恢复管理器与工作流编排器都是建立在注册表之上的处理器集合。

pub mod event;
pub mod handler;
pub mod registry;

pub use event::{HookError, HookEvent, HookEventKind, HookScratch};
pub use handler::{hook_fn, FnHandler, HookHandler};
pub use registry::{DispatchReport, HandlerOutcome, HookRegistry, RegistrationId, RegistrationInfo};
