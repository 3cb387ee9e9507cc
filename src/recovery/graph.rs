//! 任务父子关系图
//!
//! 使用邻接表和入度表实现拓扑排序：父任务总是排在引用它的子任务之前。
//! 父引用指向集合外的任务时视为根任务；成环、自引用、重复 ID 均为数据完整性错误。

use std::collections::{HashMap, VecDeque};

use crate::collaborators::TaskRecord;
use crate::core::{FusionError, FusionResult};

/// 任务父子关系图（按快照中的下标索引）
pub struct TaskGraph<'a> {
    tasks: &'a [TaskRecord],
    /// 邻接表：父任务下标 -> 子任务下标（按输入顺序）
    adjacency: Vec<Vec<usize>>,
    /// 入度表：0 或 1（每个任务至多一个父任务）
    in_degree: Vec<usize>,
    duplicate: Option<String>,
}

impl<'a> TaskGraph<'a> {
    pub fn new(tasks: &'a [TaskRecord]) -> Self {
        let mut index: HashMap<&str, usize> = HashMap::with_capacity(tasks.len());
        let mut duplicate = None;
        for (i, task) in tasks.iter().enumerate() {
            if index.insert(task.id.as_str(), i).is_some() && duplicate.is_none() {
                duplicate = Some(task.id.clone());
            }
        }

        let mut adjacency = vec![Vec::new(); tasks.len()];
        let mut in_degree = vec![0; tasks.len()];
        for (i, task) in tasks.iter().enumerate() {
            if let Some(parent) = task.parent_id.as_deref().and_then(|p| index.get(p)) {
                adjacency[*parent].push(i);
                in_degree[i] += 1;
            }
        }

        Self {
            tasks,
            adjacency,
            in_degree,
            duplicate,
        }
    }

    /// 父引用在集合内能找到的任务
    pub fn has_parent_in_set(&self, index: usize) -> bool {
        self.in_degree.get(index).copied().unwrap_or(0) > 0
    }

    /// 拓扑顺序（下标）；同一层内保持输入顺序，结果确定
    pub fn topological_order(&self) -> FusionResult<Vec<usize>> {
        if let Some(id) = &self.duplicate {
            return Err(FusionError::DataIntegrity(format!("duplicate task id in snapshot: {id}")));
        }

        let mut in_degree = self.in_degree.clone();
        let mut queue: VecDeque<usize> = in_degree
            .iter()
            .enumerate()
            .filter(|(_, d)| **d == 0)
            .map(|(i, _)| i)
            .collect();
        let mut order = Vec::with_capacity(self.tasks.len());

        while let Some(i) = queue.pop_front() {
            order.push(i);
            for &child in &self.adjacency[i] {
                in_degree[child] -= 1;
                if in_degree[child] == 0 {
                    queue.push_back(child);
                }
            }
        }

        if order.len() < self.tasks.len() {
            let stuck: Vec<&str> = in_degree
                .iter()
                .enumerate()
                .filter(|(_, d)| **d > 0)
                .map(|(i, _)| self.tasks[i].id.as_str())
                .collect();
            return Err(FusionError::DataIntegrity(format!(
                "task parent references form a cycle: {}",
                stuck.join(", ")
            )));
        }

        Ok(order)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::TaskStatus;
    use chrono::Utc;

    fn task(id: &str, parent: Option<&str>) -> TaskRecord {
        let now = Utc::now();
        TaskRecord {
            id: id.to_string(),
            content: format!("task {id}"),
            status: TaskStatus::Pending,
            tags: Vec::new(),
            parent_id: parent.map(str::to_string),
            task_type: None,
            cycle_status: None,
            test_path: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    fn ids(tasks: &[TaskRecord], order: &[usize]) -> Vec<String> {
        order.iter().map(|&i| tasks[i].id.clone()).collect()
    }

    #[test]
    fn test_parent_before_child() {
        // 子任务在输入中排在父任务之前
        let tasks = vec![
            task("c", Some("b")),
            task("b", Some("a")),
            task("a", None),
            task("d", None),
        ];
        let order = TaskGraph::new(&tasks).topological_order().unwrap();
        assert_eq!(ids(&tasks, &order), vec!["a", "d", "b", "c"]);
    }

    #[test]
    fn test_dangling_parent_is_root() {
        let tasks = vec![task("x", Some("gone"))];
        let graph = TaskGraph::new(&tasks);
        assert!(!graph.has_parent_in_set(0));
        assert_eq!(graph.topological_order().unwrap(), vec![0]);
    }

    #[test]
    fn test_cycle_is_data_integrity_error() {
        let tasks = vec![task("a", Some("b")), task("b", Some("a")), task("c", None)];
        let err = TaskGraph::new(&tasks).topological_order().unwrap_err();
        assert!(err.is_data_integrity());
        let text = err.to_string();
        assert!(text.contains('a') && text.contains('b'));
    }

    #[test]
    fn test_self_parent_is_cycle() {
        let tasks = vec![task("a", Some("a"))];
        assert!(TaskGraph::new(&tasks).topological_order().unwrap_err().is_data_integrity());
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let tasks = vec![task("a", None), task("a", None)];
        let err = TaskGraph::new(&tasks).topological_order().unwrap_err();
        assert!(err.to_string().contains("duplicate"));
    }
}
