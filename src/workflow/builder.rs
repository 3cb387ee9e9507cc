//! 工作流构建器
//!
//! 提供流畅的 API 来构建 `start_workflow` 的参数

use crate::core::{FusionError, FusionResult};

/// `start_workflow` 的参数
#[derive(Debug, Clone, PartialEq)]
pub struct WorkflowRequest {
    pub description: String,
    pub tags: Vec<String>,
    /// 创建任务后立即派发 Agent
    pub auto_start_agent: bool,
    /// Agent 完成后自动运行测试（需要 test_path）
    pub auto_run_tests: bool,
    pub test_path: Option<String>,
    /// 为空时使用 `workflow:{task_id}`
    pub memory_keys: Vec<String>,
}

impl WorkflowRequest {
    pub fn validate(&self) -> FusionResult<()> {
        if self.description.trim().is_empty() {
            return Err(FusionError::InvalidWorkflow(
                "description must not be empty".to_string(),
            ));
        }
        if self.auto_run_tests && self.test_path.as_deref().map_or(true, |p| p.trim().is_empty()) {
            return Err(FusionError::InvalidWorkflow(
                "auto_run_tests requires a test path".to_string(),
            ));
        }
        Ok(())
    }
}

/// 工作流构建器
pub struct WorkflowBuilder {
    request: WorkflowRequest,
}

impl WorkflowBuilder {
    /// 创建新的工作流构建器
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            request: WorkflowRequest {
                description: description.into(),
                tags: Vec::new(),
                auto_start_agent: true,
                auto_run_tests: false,
                test_path: None,
                memory_keys: Vec::new(),
            },
        }
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.request.tags.push(tag.into());
        self
    }

    pub fn tags(mut self, tags: Vec<String>) -> Self {
        self.request.tags = tags;
        self
    }

    pub fn auto_start_agent(mut self, enabled: bool) -> Self {
        self.request.auto_start_agent = enabled;
        self
    }

    pub fn auto_run_tests(mut self, enabled: bool) -> Self {
        self.request.auto_run_tests = enabled;
        self
    }

    /// 设置测试路径（不会自动开启 auto_run_tests）
    pub fn test_path(mut self, path: impl Into<String>) -> Self {
        self.request.test_path = Some(path.into());
        self
    }

    pub fn memory_key(mut self, key: impl Into<String>) -> Self {
        self.request.memory_keys.push(key.into());
        self
    }

    /// 构建请求
    pub fn build(self) -> FusionResult<WorkflowRequest> {
        self.request.validate()?;
        Ok(self.request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_defaults() {
        let request = WorkflowBuilder::new("add auth").build().unwrap();
        assert!(request.auto_start_agent);
        assert!(!request.auto_run_tests);
        assert!(request.memory_keys.is_empty());
    }

    #[test]
    fn test_tests_require_path() {
        let err = WorkflowBuilder::new("add auth")
            .auto_run_tests(true)
            .build()
            .unwrap_err();
        assert!(err.is_configuration());

        let request = WorkflowBuilder::new("add auth")
            .auto_run_tests(true)
            .test_path("tests/auth.test")
            .tag("auth")
            .memory_key("auth:result")
            .build()
            .unwrap();
        assert_eq!(request.test_path.as_deref(), Some("tests/auth.test"));
        assert_eq!(request.tags, vec!["auth".to_string()]);
        assert_eq!(request.memory_keys, vec!["auth:result".to_string()]);
    }

    #[test]
    fn test_empty_description_rejected() {
        assert!(WorkflowBuilder::new("  ").build().is_err());
    }
}
