//! Scheduling decisions for a single job.
//!
//! Everything here is a pure function of the workflow graph and the job's
//! current task runs. The job controller calls [`next_eligible`] after
//! every state change and applies the returned [`Decision`].

use super::dag::WorkflowDag;
use crate::types::{JobState, TaskRun, TaskState};

/// What the controller should do next, by task definition index.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Decision {
    /// Tasks to dispatch now, in definition order
    pub dispatch: Vec<usize>,
    /// Tasks that can never run and must be marked `skipped`
    pub skip: Vec<usize>,
    /// Eligible tasks left `pending` because no slot was available
    pub deferred: Vec<usize>,
}

impl Decision {
    pub fn is_empty(&self) -> bool {
        self.dispatch.is_empty() && self.skip.is_empty()
    }
}

/// Decide which tasks become dispatchable and which must be skipped.
///
/// `runs` is indexed like the workflow definition. `slots` is the number
/// of tasks the caller can start right now (the smaller of the job's own
/// headroom and the free worker-pool capacity); eligible tasks beyond it
/// stay `pending`, lowest definition index first.
pub fn next_eligible(dag: &WorkflowDag, runs: &[TaskRun], job_state: JobState, slots: usize) -> Decision {
    debug_assert_eq!(dag.len(), runs.len());

    let stopping = matches!(job_state, JobState::Stopped | JobState::Cancelled);
    let mut skipped = vec![false; runs.len()];
    let mut decision = Decision::default();

    // Walk in topological order so a skip reaches every descendant in one pass.
    for &idx in dag.topological_indices() {
        let waiting = matches!(runs[idx].state, TaskState::Pending | TaskState::Queued);
        if !waiting {
            continue;
        }

        let blocked = dag
            .dependencies(idx)
            .iter()
            .any(|&dep| skipped[dep] || runs[dep].state.blocks_dependents());

        if stopping || blocked {
            skipped[idx] = true;
        }
    }

    decision.skip = (0..runs.len()).filter(|&i| skipped[i]).collect();

    if job_state != JobState::Running {
        return decision;
    }

    let eligible = (0..runs.len()).filter(|&idx| {
        runs[idx].state == TaskState::Pending
            && !skipped[idx]
            && dag
                .dependencies(idx)
                .iter()
                .all(|&dep| runs[dep].state == TaskState::Succeeded)
    });

    for idx in eligible {
        if decision.dispatch.len() < slots {
            decision.dispatch.push(idx);
        } else {
            decision.deferred.push(idx);
        }
    }

    decision
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{TaskAction, TaskId, TaskSpec, WorkflowDefinition};

    fn dag(tasks: &[(&str, &[&str])]) -> WorkflowDag {
        let definition = WorkflowDefinition {
            name: "sched".to_string(),
            description: None,
            tasks: tasks
                .iter()
                .map(|(id, deps)| {
                    TaskSpec::new(
                        *id,
                        TaskAction::Noop {
                            result: serde_json::Value::Null,
                        },
                    )
                    .depends_on(deps)
                })
                .collect(),
        };
        WorkflowDag::validate(&definition).unwrap()
    }

    fn runs(states: &[TaskState]) -> Vec<TaskRun> {
        states
            .iter()
            .enumerate()
            .map(|(i, s)| {
                let mut run = TaskRun::pending(TaskId::new(format!("t{i}")));
                run.state = *s;
                run
            })
            .collect()
    }

    use TaskState::*;

    #[test]
    fn test_fan_out_after_root_succeeds() {
        let dag = dag(&[("a", &[]), ("b", &["a"]), ("c", &["a"])]);

        let decision = next_eligible(&dag, &runs(&[Pending, Pending, Pending]), JobState::Running, 4);
        assert_eq!(decision.dispatch, vec![0]);

        let decision = next_eligible(&dag, &runs(&[Succeeded, Pending, Pending]), JobState::Running, 4);
        assert_eq!(decision.dispatch, vec![1, 2]);
        assert!(decision.skip.is_empty());
    }

    #[test]
    fn test_tie_break_is_definition_order() {
        let dag = dag(&[("d", &[]), ("c", &[]), ("b", &[]), ("a", &[])]);
        let runs = runs(&[Pending, Pending, Pending, Pending]);

        for _ in 0..10 {
            let decision = next_eligible(&dag, &runs, JobState::Running, 2);
            assert_eq!(decision.dispatch, vec![0, 1]);
            assert_eq!(decision.deferred, vec![2, 3]);
        }
    }

    #[test]
    fn test_no_slots_defers_everything() {
        let dag = dag(&[("a", &[]), ("b", &[])]);
        let decision = next_eligible(&dag, &runs(&[Pending, Pending]), JobState::Running, 0);
        assert!(decision.dispatch.is_empty());
        assert_eq!(decision.deferred, vec![0, 1]);
    }

    #[test]
    fn test_failure_skips_all_descendants() {
        let dag = dag(&[
            ("a", &[]),
            ("b", &["a"]),
            ("c", &["b"]),
            ("d", &[]),
            ("e", &["c", "d"]),
        ]);

        let decision = next_eligible(
            &dag,
            &runs(&[Failed, Pending, Pending, Running, Pending]),
            JobState::Running,
            4,
        );

        assert_eq!(decision.skip, vec![1, 2, 4]);
        assert!(decision.dispatch.is_empty());
    }

    #[test]
    fn test_skipped_dependency_propagates() {
        let dag = dag(&[("a", &[]), ("b", &["a"])]);
        let decision = next_eligible(&dag, &runs(&[Skipped, Pending]), JobState::Running, 1);
        assert_eq!(decision.skip, vec![1]);
    }

    #[test]
    fn test_stopped_job_skips_waiting_tasks_only() {
        let dag = dag(&[("a", &[]), ("b", &["a"]), ("c", &[]), ("d", &[])]);
        let decision = next_eligible(
            &dag,
            &runs(&[Succeeded, Queued, Running, Pending]),
            JobState::Stopped,
            4,
        );

        assert_eq!(decision.skip, vec![1, 3]);
        assert!(decision.dispatch.is_empty());
    }

    #[test]
    fn test_created_job_dispatches_nothing() {
        let dag = dag(&[("a", &[])]);
        let decision = next_eligible(&dag, &runs(&[Pending]), JobState::Created, 4);
        assert!(decision.is_empty());
    }

    #[test]
    fn test_queued_retry_is_not_redispatched() {
        let dag = dag(&[("a", &[]), ("b", &[])]);
        let decision = next_eligible(&dag, &runs(&[Queued, Pending]), JobState::Running, 4);
        assert_eq!(decision.dispatch, vec![1]);
    }
}
