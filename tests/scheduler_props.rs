//! Randomized checks of the priority scheduler: any acyclic task set
//! linearises, the order respects every prerequisite, and equal inputs
//! give equal orders.

use proptest::prelude::*;
use proptest::test_runner::Config as ProptestConfig;

use faraday::ir::scheduler::{verify_order, PriTask, PriTasks, TaskId};

/// Build a task set where task `i` may only depend on tasks `< i`, so
/// the dependency graph is acyclic by construction.
fn task_set(priorities: &[f64], dep_masks: &[u32]) -> PriTasks<usize> {
    let mut tasks = PriTasks::new();
    for (i, (priority, mask)) in priorities.iter().zip(dep_masks).enumerate() {
        let depends_on: Vec<TaskId> = (0..i.min(32))
            .filter(|j| mask & (1 << j) != 0)
            .map(|j| TaskId(format!("task/{j}")))
            .collect();
        tasks.add(PriTask {
            id: TaskId(format!("task/{i}")),
            priority: *priority,
            depends_on,
            payload: i,
        });
    }
    tasks
}

proptest! {
    #![proptest_config(ProptestConfig {
        failure_persistence: None,
        .. ProptestConfig::default()
    })]

    #[test]
    fn every_acyclic_task_set_linearises_in_dependency_order(
        priorities in proptest::collection::vec(-100.0f64..100.0, 1..24),
        masks in proptest::collection::vec(any::<u32>(), 1..24),
    ) {
        let n = priorities.len().min(masks.len());
        let tasks = task_set(&priorities[..n], &masks[..n]);
        let order = tasks.linearised().expect("acyclic set must linearise");
        prop_assert_eq!(order.len(), n);
        verify_order(&tasks, &order).expect("order must respect prerequisites");
    }

    #[test]
    fn linearisation_is_deterministic(
        priorities in proptest::collection::vec(-100.0f64..100.0, 1..16),
        masks in proptest::collection::vec(any::<u32>(), 1..16),
    ) {
        let n = priorities.len().min(masks.len());
        let tasks = task_set(&priorities[..n], &masks[..n]);
        let first: Vec<String> = tasks
            .linearised()
            .expect("acyclic set must linearise")
            .iter()
            .map(|task| task.id.to_string())
            .collect();
        let second: Vec<String> = tasks
            .linearised()
            .expect("acyclic set must linearise")
            .iter()
            .map(|task| task.id.to_string())
            .collect();
        prop_assert_eq!(first, second);
    }

    #[test]
    fn unconstrained_tasks_run_in_priority_order(
        priorities in proptest::collection::vec(-100.0f64..100.0, 1..24),
    ) {
        let masks = vec![0u32; priorities.len()];
        let tasks = task_set(&priorities, &masks);
        let order = tasks.linearised().expect("acyclic set must linearise");
        for pair in order.windows(2) {
            prop_assert!(pair[0].priority >= pair[1].priority);
        }
    }
}
