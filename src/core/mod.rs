//! 核心层：统一错误类型与组件构建

pub mod builder;
pub mod error;

pub use builder::{Fusion, FusionBuilder};
pub use error::{FusionError, FusionResult};
