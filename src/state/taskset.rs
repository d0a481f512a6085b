//! Ordered groups of tasks used to compose changes.

use super::{StateGuard, TaskId};
use crate::error::Result;

/// An ordered set of task ids that are usually added to a change together.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskSet {
    tasks: Vec<TaskId>,
}

impl TaskSet {
    pub fn new(tasks: impl IntoIterator<Item = TaskId>) -> Self {
        let mut set = Self::default();
        for task in tasks {
            set.add_task(task);
        }
        set
    }

    /// Adds a task; duplicates are ignored.
    pub fn add_task(&mut self, task: TaskId) {
        if !self.tasks.contains(&task) {
            self.tasks.push(task);
        }
    }

    /// Adds every task of another set.
    pub fn add_all(&mut self, other: &TaskSet) {
        for task in &other.tasks {
            self.add_task(*task);
        }
    }

    pub fn tasks(&self) -> &[TaskId] {
        &self.tasks
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Makes every task in the set wait for `dependency`.
    pub fn wait_for(&self, st: &mut StateGuard<'_>, dependency: TaskId) -> Result<()> {
        for task in &self.tasks {
            st.wait_for(*task, dependency)?;
        }
        Ok(())
    }

    /// Makes every task in the set wait for every task in `other`.
    pub fn wait_all(&self, st: &mut StateGuard<'_>, other: &TaskSet) -> Result<()> {
        for task in &self.tasks {
            st.wait_all(*task, other)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::State;

    #[test]
    fn test_taskset_ignores_duplicates() {
        let mut set = TaskSet::new([TaskId::new(1), TaskId::new(2), TaskId::new(1)]);
        assert_eq!(set.len(), 2);
        set.add_all(&TaskSet::new([TaskId::new(2), TaskId::new(3)]));
        assert_eq!(set.tasks(), &[TaskId::new(1), TaskId::new(2), TaskId::new(3)]);
    }

    #[test]
    fn test_taskset_wait_all_links_every_pair() {
        let state = State::default();
        let mut st = state.lock();
        let a = st.new_task("download", "a");
        let b = st.new_task("download", "b");
        let c = st.new_task("link", "c");
        let d = st.new_task("link", "d");

        let first = TaskSet::new([a, b]);
        let second = TaskSet::new([c, d]);
        second.wait_all(&mut st, &first).expect("wait_all");

        for later in [c, d] {
            let task = st.task(later).expect("task");
            assert_eq!(task.wait_tasks(), &[a, b]);
        }
        assert_eq!(st.task(a).expect("task").halt_tasks(), &[c, d]);
    }
}
