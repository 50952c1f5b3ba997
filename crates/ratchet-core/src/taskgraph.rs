//! Pure scheduling algorithms over a task list.
//!
//! Topological ordering, readiness selection, and deadlock detection. All
//! functions take the task list by reference and return new containers --
//! they never mutate the input array or its elements, and perform no I/O.
//!
//! Dependency edges are resolved through normalized ids ([`normalize_id`]
//! strips a single leading `#`). Tasks with a missing or duplicated id never
//! act as dependency targets: they are excluded from ordering and treated as
//! trailing leaves.

use std::collections::{HashMap, HashSet};

use ratchet_types::task::{Task, TaskStatus, normalize_id};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Id resolution
// ---------------------------------------------------------------------------

/// Map from normalized id to task index, for ids that are present exactly
/// once. Duplicated ids are dropped entirely (neither occurrence resolves).
fn unique_id_index(tasks: &[Task]) -> HashMap<String, usize> {
    let mut counts: HashMap<String, usize> = HashMap::new();
    for task in tasks {
        if let Some(id) = task.normalized_id() {
            *counts.entry(id).or_insert(0) += 1;
        }
    }

    let mut index = HashMap::new();
    for (i, task) in tasks.iter().enumerate() {
        if let Some(id) = task.normalized_id()
            && counts.get(&id) == Some(&1)
        {
            index.insert(id, i);
        }
    }
    index
}

// ---------------------------------------------------------------------------
// Topological sort
// ---------------------------------------------------------------------------

/// Stable Kahn-style topological sort: a copy of the task list reordered so
/// that every resolvable blocker precedes its dependents.
///
/// - Among tasks whose blockers are all placed, ties break by original array
///   position.
/// - Tasks with a missing or duplicated id, or with any unknown blocker id,
///   are excluded from ordering and appended in original relative order
///   after all resolved tasks.
/// - Tasks inside a dependency cycle (or downstream of one) are appended in
///   original relative order after all acyclic tasks.
pub fn sort_topologically(tasks: &[Task]) -> Vec<Task> {
    let index = unique_id_index(tasks);

    // Partition: a task participates in ordering iff its own id resolves and
    // every normalized blocker is a known unique id.
    let included: Vec<usize> = (0..tasks.len())
        .filter(|&i| {
            let own_id_ok = tasks[i]
                .normalized_id()
                .is_some_and(|id| index.get(&id) == Some(&i));
            own_id_ok
                && tasks[i]
                    .blocked_by
                    .iter()
                    .all(|b| index.contains_key(&normalize_id(b)))
        })
        .collect();
    let included_set: HashSet<usize> = included.iter().copied().collect();

    // Stable Kahn: repeatedly take the first included task (original order)
    // whose blockers are all placed. Edges only count between included
    // tasks; a blocker that was itself excluded cannot gate anything.
    let mut placed: Vec<usize> = Vec::with_capacity(included.len());
    let mut placed_set: HashSet<usize> = HashSet::new();
    loop {
        let next = included.iter().copied().find(|&i| {
            !placed_set.contains(&i)
                && tasks[i].blocked_by.iter().all(|b| {
                    match index.get(&normalize_id(b)) {
                        Some(&j) => !included_set.contains(&j) || placed_set.contains(&j),
                        None => true,
                    }
                })
        });
        match next {
            Some(i) => {
                placed.push(i);
                placed_set.insert(i);
            }
            None => break,
        }
    }

    let mut out: Vec<Task> = placed.iter().map(|&i| tasks[i].clone()).collect();
    // Cycle members (included but never placeable), original order.
    out.extend(
        included
            .iter()
            .copied()
            .filter(|i| !placed_set.contains(i))
            .map(|i| tasks[i].clone()),
    );
    // Excluded tasks trail last, original order.
    out.extend(
        (0..tasks.len())
            .filter(|i| !included_set.contains(i))
            .map(|i| tasks[i].clone()),
    );
    out
}

// ---------------------------------------------------------------------------
// Readiness
// ---------------------------------------------------------------------------

/// Tasks that can start now, in original array order.
///
/// A task is ready iff it is pending and every normalized blocker resolves
/// to a completed task. An unknown or unresolvable blocker id is NOT treated
/// as satisfied.
pub fn ready_tasks(tasks: &[Task]) -> Vec<Task> {
    let index = unique_id_index(tasks);
    tasks
        .iter()
        .filter(|task| is_ready(tasks, &index, task))
        .cloned()
        .collect()
}

/// Position of the first ready task in original array order.
pub fn first_ready_index(tasks: &[Task]) -> Option<usize> {
    let index = unique_id_index(tasks);
    tasks.iter().position(|task| is_ready(tasks, &index, task))
}

fn is_ready(tasks: &[Task], index: &HashMap<String, usize>, task: &Task) -> bool {
    task.status == TaskStatus::Pending
        && task.blocked_by.iter().all(|b| {
            index
                .get(&normalize_id(b))
                .is_some_and(|&j| tasks[j].status == TaskStatus::Completed)
        })
}

// ---------------------------------------------------------------------------
// Deadlock detection
// ---------------------------------------------------------------------------

/// Result of a deadlock scan, tagged for the display layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Deadlock {
    /// No deadlock among the current tasks.
    None,
    /// A dependency cycle; contains every task id on the cycle.
    Cycle { cycle: Vec<String> },
    /// The first pending task (original order) blocked by errored tasks.
    ErrorDependency {
        task_id: String,
        error_dependencies: Vec<String>,
    },
}

/// Detect a deadlock, in priority order: dependency cycle first, then
/// error-dependency, then none.
///
/// Cycle detection runs a DFS three-coloring over normalized `blocked_by`
/// edges, ignoring unknown targets and tasks whose ids are missing or
/// duplicated. A self-referential blocker yields a length-1 cycle. The cycle
/// result takes precedence even when an error-dependency also exists.
pub fn detect_deadlock(tasks: &[Task]) -> Deadlock {
    let index = unique_id_index(tasks);

    if let Some(cycle) = find_cycle(tasks, &index) {
        return Deadlock::Cycle { cycle };
    }

    // Error-dependency: first pending task with at least one blocker that
    // resolves to an error-status task. Non-pending tasks are exempt even if
    // their blockers errored.
    for task in tasks {
        if task.status != TaskStatus::Pending {
            continue;
        }
        let error_deps: Vec<String> = task
            .blocked_by
            .iter()
            .filter_map(|b| index.get(&normalize_id(b)))
            .filter(|&&i| tasks[i].status == TaskStatus::Error)
            .filter_map(|&i| tasks[i].id.clone())
            .collect();
        if !error_deps.is_empty() {
            return Deadlock::ErrorDependency {
                task_id: task.id.clone().unwrap_or_default(),
                error_dependencies: error_deps,
            };
        }
    }

    Deadlock::None
}

#[derive(Clone, Copy, PartialEq)]
enum Color {
    White,
    Gray,
    Black,
}

/// DFS coloring over dependency edges; returns the ids (original form) of
/// every task on the first cycle found.
fn find_cycle(tasks: &[Task], index: &HashMap<String, usize>) -> Option<Vec<String>> {
    let mut colors = vec![Color::White; tasks.len()];
    let mut path: Vec<usize> = Vec::new();

    fn visit(
        i: usize,
        tasks: &[Task],
        index: &HashMap<String, usize>,
        colors: &mut [Color],
        path: &mut Vec<usize>,
    ) -> Option<Vec<usize>> {
        colors[i] = Color::Gray;
        path.push(i);
        for blocker in &tasks[i].blocked_by {
            let Some(&j) = index.get(&normalize_id(blocker)) else {
                continue;
            };
            match colors[j] {
                Color::Gray => {
                    // Back edge: the cycle is the path suffix starting at j.
                    let start = path.iter().position(|&p| p == j).unwrap_or(0);
                    return Some(path[start..].to_vec());
                }
                Color::White => {
                    if let Some(cycle) = visit(j, tasks, index, colors, path) {
                        return Some(cycle);
                    }
                }
                Color::Black => {}
            }
        }
        path.pop();
        colors[i] = Color::Black;
        None
    }

    for i in 0..tasks.len() {
        // Only tasks that resolve as dependency targets participate.
        let participates = tasks[i]
            .normalized_id()
            .is_some_and(|id| index.get(&id) == Some(&i));
        if participates && colors[i] == Color::White {
            if let Some(cycle) = visit(i, tasks, index, &mut colors, &mut path) {
                return Some(
                    cycle
                        .into_iter()
                        .filter_map(|i| tasks[i].id.clone())
                        .collect(),
                );
            }
            path.clear();
        }
    }
    None
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
