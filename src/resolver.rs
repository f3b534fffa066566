//! Dependency Resolver (C5): turns a declarative task DAG into a stream of
//! ready-to-dispatch task ids, and recomputes readiness as tasks complete.

use std::collections::{HashMap, HashSet, VecDeque};

use serde_json::Value;

use crate::model::{FailureStrategy, Task, TaskStatus};

#[derive(Debug, thiserror::Error)]
pub enum ResolverError {
    #[error("dependency cycle detected among tasks: {0:?}")]
    CircularDependency(Vec<String>),

    #[error("task {task} references unknown task id {reference}")]
    UnknownReference { task: String, reference: String },

    #[error("task {0} references itself")]
    SelfReference(String),
}

/// What to do with the rest of a workflow once `failed_task` has failed.
#[derive(Debug, Clone)]
pub enum FailureCascade {
    /// Mark every non-terminal task cancelled; workflow fails.
    CancelAll,
    /// Mark only tasks transitively dependent on `failed_task` skipped.
    SkipDependents(Vec<String>),
    /// Mark only dependents whose params reference `failed_task` skipped.
    SkipReferencing(Vec<String>),
}

/// Scans `params` for `${task_id.path}` references, collecting the
/// referenced task ids. Shared with the substitution engine's own scanner
/// but used here only to discover implicit dependencies, not to resolve
/// values.
pub fn referenced_task_ids(params: &Value) -> HashSet<String> {
    let mut ids = HashSet::new();
    collect_refs(params, &mut ids);
    ids
}

fn collect_refs(value: &Value, out: &mut HashSet<String>) {
    match value {
        Value::String(s) => {
            for m in crate::substitution::find_references(s) {
                out.insert(m.task_id.to_string());
            }
        }
        Value::Array(items) => items.iter().for_each(|v| collect_refs(v, out)),
        Value::Object(map) => map.values().for_each(|v| collect_refs(v, out)),
        _ => {}
    }
}

/// A workflow's dependency graph, computed once at submission and consulted
/// throughout execution to decide what's newly ready.
pub struct DependencyGraph {
    /// task_id -> effective dependencies (explicit ∪ implicit-by-reference).
    effective_deps: HashMap<String, HashSet<String>>,
    /// task_id -> direct dependents (reverse edges of `effective_deps`).
    dependents: HashMap<String, HashSet<String>>,
}

impl DependencyGraph {
    /// Validate and build the graph for one workflow's tasks.
    ///
    /// 1. Every explicit dependency must name a task in the same workflow.
    /// 2. Every `${id.path}` reference in `params` must name a task in the
    ///    same workflow and must not be the task itself; references become
    ///    implicit dependencies.
    /// 3. The resulting graph must be acyclic.
    pub fn build(tasks: &[Task]) -> Result<Self, ResolverError> {
        let ids: HashSet<&str> = tasks.iter().map(|t| t.id.as_str()).collect();
        let mut effective_deps: HashMap<String, HashSet<String>> = HashMap::new();

        for task in tasks {
            let mut deps: HashSet<String> = task.dependencies.clone();
            for dep in &task.dependencies {
                if !ids.contains(dep.as_str()) {
                    return Err(ResolverError::UnknownReference {
                        task: task.id.clone(),
                        reference: dep.clone(),
                    });
                }
            }

            for referenced in referenced_task_ids(&task.params) {
                if referenced == task.id {
                    return Err(ResolverError::SelfReference(task.id.clone()));
                }
                if !ids.contains(referenced.as_str()) {
                    return Err(ResolverError::UnknownReference {
                        task: task.id.clone(),
                        reference: referenced,
                    });
                }
                deps.insert(referenced);
            }

            effective_deps.insert(task.id.clone(), deps);
        }

        assert_acyclic(&effective_deps)?;

        let mut dependents: HashMap<String, HashSet<String>> = tasks.iter().map(|t| (t.id.clone(), HashSet::new())).collect();
        for (task_id, deps) in &effective_deps {
            for dep in deps {
                dependents.entry(dep.clone()).or_default().insert(task_id.clone());
            }
        }

        Ok(Self { effective_deps, dependents })
    }

    /// The initial ready set: every task whose effective dependencies are empty.
    pub fn initial_ready_set(&self) -> Vec<String> {
        self.effective_deps
            .iter()
            .filter(|(_, deps)| deps.is_empty())
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Given the set of tasks that just reached a terminal-success status,
    /// return the direct dependents that are now fully satisfied (every one
    /// of their effective dependencies appears in `completed`).
    ///
    /// Idempotent: calling this repeatedly with the same `completed` set
    /// yields the same output, since it derives purely from the graph plus
    /// the caller-supplied completion set.
    pub fn newly_ready(&self, just_completed: &str, completed: &HashSet<String>) -> Vec<String> {
        let Some(dependents) = self.dependents.get(just_completed) else {
            return Vec::new();
        };
        dependents
            .iter()
            .filter(|dependent| {
                self.effective_deps
                    .get(*dependent)
                    .map(|deps| deps.iter().all(|d| completed.contains(d)))
                    .unwrap_or(false)
            })
            .cloned()
            .collect()
    }

    /// Every transitive dependent of `task_id`, BFS order (used by
    /// `skip_dependents`).
    pub fn transitive_dependents(&self, task_id: &str) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut queue = VecDeque::from([task_id.to_string()]);
        let mut out = Vec::new();
        while let Some(current) = queue.pop_front() {
            let Some(direct) = self.dependents.get(&current) else { continue };
            for dependent in direct {
                if seen.insert(dependent.clone()) {
                    out.push(dependent.clone());
                    queue.push_back(dependent.clone());
                }
            }
        }
        out
    }

    /// Dependents whose `params` directly reference `task_id` (used by
    /// `continue_on_error`, which only skips tasks that actually need the
    /// failed task's result, not every downstream task).
    pub fn referencing_dependents<'a>(&self, task_id: &str, tasks: &'a [Task]) -> Vec<&'a Task> {
        let by_id: HashMap<&str, &Task> = tasks.iter().map(|t| (t.id.as_str(), t)).collect();
        self.dependents
            .get(task_id)
            .into_iter()
            .flatten()
            .filter_map(|id| by_id.get(id.as_str()).copied())
            .filter(|t| referenced_task_ids(&t.params).contains(task_id))
            .collect()
    }

    pub fn effective_dependencies(&self, task_id: &str) -> Option<&HashSet<String>> {
        self.effective_deps.get(task_id)
    }
}

fn assert_acyclic(effective_deps: &HashMap<String, HashSet<String>>) -> Result<(), ResolverError> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Unvisited,
        InProgress,
        Done,
    }

    let mut marks: HashMap<&str, Mark> = effective_deps.keys().map(|k| (k.as_str(), Mark::Unvisited)).collect();
    let mut stack = Vec::new();

    fn visit<'a>(
        node: &'a str,
        effective_deps: &'a HashMap<String, HashSet<String>>,
        marks: &mut HashMap<&'a str, Mark>,
        stack: &mut Vec<String>,
    ) -> Result<(), ResolverError> {
        match marks.get(node) {
            Some(Mark::Done) => return Ok(()),
            Some(Mark::InProgress) => {
                let cycle_start = stack.iter().position(|n| n == node).unwrap_or(0);
                return Err(ResolverError::CircularDependency(stack[cycle_start..].to_vec()));
            }
            _ => {}
        }
        marks.insert(node, Mark::InProgress);
        stack.push(node.to_string());
        if let Some(deps) = effective_deps.get(node) {
            for dep in deps {
                visit(dep, effective_deps, marks, stack)?;
            }
        }
        stack.pop();
        marks.insert(node, Mark::Done);
        Ok(())
    }

    let keys: Vec<String> = effective_deps.keys().cloned().collect();
    for key in &keys {
        visit(key, effective_deps, &mut marks, &mut stack)?;
    }
    Ok(())
}

/// Decide how a fatal task failure cascades, given the workflow's strategy.
pub fn cascade_for_failure(strategy: FailureStrategy, failed_task_id: &str, graph: &DependencyGraph, tasks: &[Task]) -> FailureCascade {
    match strategy {
        FailureStrategy::StopOnFirstFailure => FailureCascade::CancelAll,
        FailureStrategy::SkipDependents => FailureCascade::SkipDependents(graph.transitive_dependents(failed_task_id)),
        FailureStrategy::ContinueOnError => {
            FailureCascade::SkipReferencing(graph.referencing_dependents(failed_task_id, tasks).into_iter().map(|t| t.id.clone()).collect())
        }
    }
}

/// True once every task in `tasks` has reached a terminal status.
pub fn workflow_is_complete(tasks: &[Task]) -> bool {
    tasks.iter().all(|t| t.status.is_terminal())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::TaskSubmission;
    use uuid::Uuid;

    fn task(id: &str, deps: &[&str], params: Value) -> Task {
        let mut t = Task::from_submission(
            Uuid::nil(),
            TaskSubmission {
                id: id.to_string(),
                method: "llm/generate".into(),
                params,
                dependencies: deps.iter().map(|s| s.to_string()).collect(),
                priority: None,
                timeout_seconds: None,
                retry: None,
            },
        );
        t.status = TaskStatus::Pending;
        t
    }

    #[test]
    fn initial_ready_set_is_tasks_with_no_dependencies() {
        let tasks = vec![task("a", &[], Value::Null), task("b", &["a"], Value::Null)];
        let graph = DependencyGraph::build(&tasks).unwrap();
        assert_eq!(graph.initial_ready_set(), vec!["a".to_string()]);
    }

    #[test]
    fn detects_cycles() {
        let tasks = vec![task("a", &["b"], Value::Null), task("b", &["a"], Value::Null)];
        let err = DependencyGraph::build(&tasks).unwrap_err();
        assert!(matches!(err, ResolverError::CircularDependency(_)));
    }

    #[test]
    fn implicit_dependency_from_substitution_reference() {
        let tasks = vec![
            task("t1", &[], Value::Null),
            task("t2", &[], serde_json::json!({"n": "${t1.x}"})),
        ];
        let graph = DependencyGraph::build(&tasks).unwrap();
        assert_eq!(graph.initial_ready_set(), vec!["t1".to_string()]);
        let completed: HashSet<String> = ["t1".to_string()].into_iter().collect();
        assert_eq!(graph.newly_ready("t1", &completed), vec!["t2".to_string()]);
    }

    #[test]
    fn self_reference_is_rejected() {
        let tasks = vec![task("t1", &[], serde_json::json!({"n": "${t1.x}"}))];
        let err = DependencyGraph::build(&tasks).unwrap_err();
        assert!(matches!(err, ResolverError::SelfReference(_)));
    }

    #[test]
    fn reference_outside_workflow_is_rejected() {
        let tasks = vec![task("t1", &[], serde_json::json!({"n": "${ghost.x}"}))];
        let err = DependencyGraph::build(&tasks).unwrap_err();
        assert!(matches!(err, ResolverError::UnknownReference { .. }));
    }

    #[test]
    fn fan_out_fan_in_readiness() {
        let tasks = vec![
            task("a", &[], Value::Null),
            task("b1", &["a"], Value::Null),
            task("b2", &["a"], Value::Null),
            task("c", &["b1", "b2"], Value::Null),
        ];
        let graph = DependencyGraph::build(&tasks).unwrap();
        assert_eq!(graph.initial_ready_set(), vec!["a".to_string()]);

        let completed_after_a: HashSet<String> = ["a".to_string()].into_iter().collect();
        let mut newly_ready = graph.newly_ready("a", &completed_after_a);
        newly_ready.sort();
        assert_eq!(newly_ready, vec!["b1".to_string(), "b2".to_string()]);

        let completed_after_b1: HashSet<String> = ["a".to_string(), "b1".to_string()].into_iter().collect();
        assert!(graph.newly_ready("b1", &completed_after_b1).is_empty());

        let completed_after_both: HashSet<String> = ["a".to_string(), "b1".to_string(), "b2".to_string()].into_iter().collect();
        assert_eq!(graph.newly_ready("b2", &completed_after_both), vec!["c".to_string()]);
    }

    #[test]
    fn skip_dependents_is_transitive() {
        let tasks = vec![
            task("a", &[], Value::Null),
            task("b", &["a"], Value::Null),
            task("c", &["b"], Value::Null),
        ];
        let graph = DependencyGraph::build(&tasks).unwrap();
        let mut dependents = graph.transitive_dependents("a");
        dependents.sort();
        assert_eq!(dependents, vec!["b".to_string(), "c".to_string()]);
    }
}
