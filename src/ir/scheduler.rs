//! Priority-constrained task linearization.
//!
//! A [`PriTask`] is a unit of work with a priority and prerequisites.
//! [`PriTasks::linearised`] emits the unique order that respects every
//! prerequisite and at each step runs the highest-priority unblocked
//! task, ties broken by insertion order. Payloads are plain data the
//! caller interprets, which keeps task sets inspectable in tests.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use crate::error::{internal_error, CompileError, Result};

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId(pub String);

impl TaskId {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone)]
pub struct PriTask<P> {
    pub id: TaskId,
    pub priority: f64,
    pub depends_on: Vec<TaskId>,
    pub payload: P,
}

impl<P> PriTask<P> {
    #[must_use]
    pub fn new(id: TaskId, priority: f64, depends_on: Vec<TaskId>, payload: P) -> Self {
        Self {
            id,
            priority,
            depends_on,
            payload,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PriTasks<P> {
    tasks: Vec<PriTask<P>>,
    index: std::collections::BTreeMap<TaskId, usize>,
}

impl<P> Default for PriTasks<P> {
    fn default() -> Self {
        Self {
            tasks: Vec::new(),
            index: std::collections::BTreeMap::new(),
        }
    }
}

/// Heap key: higher priority first, earlier insertion wins ties.
struct Ready {
    priority: f64,
    seq: usize,
}

impl PartialEq for Ready {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}
impl Eq for Ready {}
impl PartialOrd for Ready {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Ready {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .total_cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl<P> PriTasks<P> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a task. Re-adding an id is a no-op; the first registration
    /// wins. Returns whether the task was new.
    pub fn add(&mut self, task: PriTask<P>) -> bool {
        if self.index.contains_key(&task.id) {
            return false;
        }
        self.index.insert(task.id.clone(), self.tasks.len());
        self.tasks.push(task);
        true
    }

    #[must_use]
    pub fn contains(&self, id: &TaskId) -> bool {
        self.index.contains_key(id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    #[must_use]
    pub fn get(&self, id: &TaskId) -> Option<&PriTask<P>> {
        self.index.get(id).map(|i| &self.tasks[*i])
    }

    /// The unique prerequisite-respecting, priority-greedy order.
    pub fn linearised(&self) -> Result<Vec<&PriTask<P>>> {
        let mut remaining: Vec<usize> = Vec::with_capacity(self.tasks.len());
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); self.tasks.len()];
        for (seq, task) in self.tasks.iter().enumerate() {
            let mut count = 0;
            for dep in &task.depends_on {
                let dep_seq = self.index.get(dep).ok_or_else(|| {
                    CompileError::UnresolvedTask {
                        dep: dep.to_string(),
                        dependent: task.id.to_string(),
                    }
                })?;
                // Self-dependencies and duplicates still count once
                // each; duplicates resolve as their dep completes.
                dependents[*dep_seq].push(seq);
                count += 1;
            }
            remaining.push(count);
        }

        let mut heap = BinaryHeap::new();
        for (seq, task) in self.tasks.iter().enumerate() {
            if remaining[seq] == 0 {
                heap.push(Ready {
                    priority: task.priority,
                    seq,
                });
            }
        }

        let mut order = Vec::with_capacity(self.tasks.len());
        while let Some(ready) = heap.pop() {
            order.push(&self.tasks[ready.seq]);
            for dependent in &dependents[ready.seq] {
                remaining[*dependent] -= 1;
                if remaining[*dependent] == 0 {
                    heap.push(Ready {
                        priority: self.tasks[*dependent].priority,
                        seq: *dependent,
                    });
                }
            }
        }

        if order.len() != self.tasks.len() {
            return Err(internal_error(
                "task dependencies contain a cycle".to_string(),
            ));
        }
        Ok(order)
    }
}

/// Check that `order` schedules every prerequisite before its
/// dependent. Test helper and post-lowering guard.
pub fn verify_order<P>(tasks: &PriTasks<P>, order: &[&PriTask<P>]) -> Result<()> {
    let mut seen = std::collections::BTreeSet::new();
    for task in order {
        for dep in &task.depends_on {
            if !seen.contains(dep) {
                return Err(internal_error(format!(
                    "task {} ran before its prerequisite {dep}",
                    task.id
                )));
            }
        }
        seen.insert(task.id.clone());
    }
    if order.len() != tasks.len() {
        return Err(internal_error("order does not cover all tasks"));
    }
    Ok(())
}
