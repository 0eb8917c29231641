//! Task DAG (Directed Acyclic Graph) for dependency management.
//!
//! `TaskDAG` stores tasks as petgraph nodes with an edge from every
//! dependency to its dependent. Graphs are validated up front: unknown or
//! self-referential dependencies and cycles are rejected before anything
//! runs. `ReadySet` then tracks, incrementally, which tasks may start.

use crate::core::task::{Task, TaskId};
use crate::error::{Error, Result};
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use std::cmp::{Ordering, Reverse};
use std::collections::{BTreeMap, BinaryHeap, HashMap, HashSet};

/// The task dependency graph.
pub struct TaskDAG {
    /// Nodes are tasks; an edge `a -> b` means `b` depends on `a`.
    graph: DiGraph<Task, ()>,
    /// Index mapping from TaskId to NodeIndex for fast lookups.
    task_index: HashMap<TaskId, NodeIndex>,
}

impl TaskDAG {
    /// Create a new empty TaskDAG.
    pub fn new() -> Self {
        Self {
            graph: DiGraph::new(),
            task_index: HashMap::new(),
        }
    }

    /// Build and validate a DAG from a task list.
    ///
    /// # Errors
    /// - `Validation` if two tasks share an id
    /// - `InvalidDependency` if a dependency is unknown or the task itself
    /// - `CycleDetected` with the offending cycle if the graph is cyclic
    pub fn from_tasks(tasks: Vec<Task>) -> Result<Self> {
        let mut dag = Self::new();
        let mut edges = Vec::new();

        for task in tasks {
            if dag.task_index.contains_key(&task.id) {
                return Err(Error::Validation(format!("Duplicate task id {}", task.id)));
            }
            for dep in &task.dependencies {
                edges.push((*dep, task.id));
            }
            dag.add_task(task);
        }

        for (from, to) in edges {
            if from == to {
                return Err(Error::InvalidDependency {
                    task: to,
                    dependency: from,
                    reason: "a task cannot depend on itself".to_string(),
                });
            }
            let (Some(&from_index), Some(&to_index)) =
                (dag.task_index.get(&from), dag.task_index.get(&to))
            else {
                return Err(Error::InvalidDependency {
                    task: to,
                    dependency: from,
                    reason: "no task with that id".to_string(),
                });
            };
            dag.graph.update_edge(from_index, to_index, ());
        }

        if let Some(cycle) = dag.find_cycle() {
            return Err(Error::CycleDetected { cycle });
        }
        Ok(dag)
    }

    /// Add a task to the DAG.
    ///
    /// If a task with the same id already exists, returns its NodeIndex and
    /// leaves the graph unchanged.
    pub fn add_task(&mut self, task: Task) -> NodeIndex {
        if let Some(&index) = self.task_index.get(&task.id) {
            return index;
        }

        let id = task.id;
        let index = self.graph.add_node(task);
        self.task_index.insert(id, index);
        index
    }

    /// Find a cycle with a depth-first search that keeps the current path
    /// on a recursion stack.
    ///
    /// Returns the cycle in edge order with the first node repeated at the
    /// end, e.g. `[1, 2, 3, 1]`. Roots and successors are visited in
    /// ascending id order so the reported cycle is deterministic.
    pub fn find_cycle(&self) -> Option<Vec<TaskId>> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Unvisited,
            OnStack,
            Done,
        }

        let mut marks = vec![Mark::Unvisited; self.graph.node_count()];
        let mut roots: Vec<NodeIndex> = self.graph.node_indices().collect();
        roots.sort_by_key(|&index| self.graph[index].id);

        for root in roots {
            if marks[root.index()] != Mark::Unvisited {
                continue;
            }
            marks[root.index()] = Mark::OnStack;
            let mut path = vec![root];
            let mut frontiers = vec![self.successors_for_dfs(root)];

            loop {
                let Some(frontier) = frontiers.last_mut() else {
                    break;
                };
                let next = frontier.pop();
                match next {
                    Some(node) => match marks[node.index()] {
                        Mark::OnStack => {
                            let start = path.iter().position(|&n| n == node).unwrap_or(0);
                            let mut cycle: Vec<TaskId> =
                                path[start..].iter().map(|&n| self.graph[n].id).collect();
                            cycle.push(self.graph[node].id);
                            return Some(cycle);
                        }
                        Mark::Unvisited => {
                            marks[node.index()] = Mark::OnStack;
                            path.push(node);
                            frontiers.push(self.successors_for_dfs(node));
                        }
                        Mark::Done => {}
                    },
                    None => {
                        frontiers.pop();
                        if let Some(done) = path.pop() {
                            marks[done.index()] = Mark::Done;
                        }
                    }
                }
            }
        }
        None
    }

    /// Successors sorted by descending id, so popping yields ascending ids.
    fn successors_for_dfs(&self, index: NodeIndex) -> Vec<NodeIndex> {
        let mut next: Vec<NodeIndex> = self
            .graph
            .neighbors_directed(index, Direction::Outgoing)
            .collect();
        next.sort_by_key(|&n| Reverse(self.graph[n].id));
        next
    }

    /// Get a reference to a task by its ID.
    pub fn get_task(&self, id: &TaskId) -> Option<&Task> {
        self.task_index
            .get(id)
            .and_then(|&index| self.graph.node_weight(index))
    }

    /// Get the number of tasks in the DAG.
    pub fn task_count(&self) -> usize {
        self.graph.node_count()
    }

    /// Get the number of dependency edges in the DAG.
    pub fn dependency_count(&self) -> usize {
        self.graph.edge_count()
    }

    /// Check if `to` directly depends on `from`.
    pub fn has_dependency(&self, from: &TaskId, to: &TaskId) -> bool {
        match (self.task_index.get(from), self.task_index.get(to)) {
            (Some(&from_idx), Some(&to_idx)) => self.graph.find_edge(from_idx, to_idx).is_some(),
            _ => false,
        }
    }

    /// Ids of the tasks the given task depends on, ascending.
    pub fn dependencies_of(&self, id: &TaskId) -> Vec<TaskId> {
        self.neighbor_ids(id, Direction::Incoming)
    }

    /// Ids of the tasks that depend on the given task, ascending.
    pub fn dependents_of(&self, id: &TaskId) -> Vec<TaskId> {
        self.neighbor_ids(id, Direction::Outgoing)
    }

    fn neighbor_ids(&self, id: &TaskId, direction: Direction) -> Vec<TaskId> {
        let Some(&index) = self.task_index.get(id) else {
            return Vec::new();
        };
        let mut ids: Vec<TaskId> = self
            .graph
            .neighbors_directed(index, direction)
            .map(|n| self.graph[n].id)
            .collect();
        ids.sort();
        ids
    }

    /// All task ids, ascending.
    pub fn task_ids(&self) -> Vec<TaskId> {
        let mut ids: Vec<TaskId> = self.task_index.keys().copied().collect();
        ids.sort();
        ids
    }

    /// Get all tasks in the DAG.
    pub fn all_tasks(&self) -> Vec<&Task> {
        self.graph.node_weights().collect()
    }

    /// Check if the DAG is empty.
    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    /// Check if the DAG contains a task.
    pub fn contains_task(&self, id: &TaskId) -> bool {
        self.task_index.contains_key(id)
    }

    /// Tasks in an order where each task comes after all of its dependencies.
    pub fn topological_order(&self) -> Result<Vec<&Task>> {
        let sorted = toposort(&self.graph, None).map_err(|cycle| {
            let id = self.graph[cycle.node_id()].id;
            Error::CycleDetected {
                cycle: vec![id, id],
            }
        })?;

        Ok(sorted
            .into_iter()
            .filter_map(|index| self.graph.node_weight(index))
            .collect())
    }

    /// Group tasks by dependency depth.
    ///
    /// Level 0 holds tasks without dependencies; a task sits one level
    /// below its deepest dependency. Each level is sorted by id.
    pub fn levels(&self) -> Result<Vec<Vec<TaskId>>> {
        let mut depth: HashMap<TaskId, usize> = HashMap::new();
        let mut by_level: BTreeMap<usize, Vec<TaskId>> = BTreeMap::new();

        for task in self.topological_order()? {
            let level = self
                .dependencies_of(&task.id)
                .iter()
                .filter_map(|dep| depth.get(dep))
                .map(|d| d + 1)
                .max()
                .unwrap_or(0);
            depth.insert(task.id, level);
            by_level.entry(level).or_default().push(task.id);
        }

        Ok(by_level
            .into_values()
            .map(|mut ids| {
                ids.sort();
                ids
            })
            .collect())
    }
}

impl Default for TaskDAG {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TaskDAG {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskDAG")
            .field("tasks", &self.task_count())
            .field("dependencies", &self.dependency_count())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ReadyEntry {
    score: u8,
    id: TaskId,
}

impl Ord for ReadyEntry {
    // Max-heap: higher score first, then lower id.
    fn cmp(&self, other: &Self) -> Ordering {
        self.score
            .cmp(&other.score)
            .then_with(|| other.id.cmp(&self.id))
    }
}

impl PartialOrd for ReadyEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Incremental ready-set tracker.
///
/// Keeps, for every unresolved task, the number of dependencies that are not
/// yet terminal. Resolving a task decrements its dependents' counts and
/// moves the ones that reach zero into the ready queue, so a full run costs
/// O(tasks + edges).
#[derive(Debug)]
pub struct ReadySet {
    remaining: HashMap<TaskId, usize>,
    dependents: HashMap<TaskId, Vec<TaskId>>,
    scores: HashMap<TaskId, u8>,
    queue: BinaryHeap<ReadyEntry>,
    resolved: HashSet<TaskId>,
}

impl ReadySet {
    /// Track every task in the DAG, none resolved yet.
    pub fn new(dag: &TaskDAG) -> Self {
        Self::with_resolved(dag, &HashSet::new())
    }

    /// Track the DAG with some tasks already resolved (e.g. restored from
    /// a checkpoint). Resolved tasks never enter the ready queue.
    pub fn with_resolved(dag: &TaskDAG, already: &HashSet<TaskId>) -> Self {
        let mut set = Self {
            remaining: HashMap::new(),
            dependents: HashMap::new(),
            scores: HashMap::new(),
            queue: BinaryHeap::new(),
            resolved: HashSet::new(),
        };

        for task in dag.all_tasks() {
            set.dependents.insert(task.id, dag.dependents_of(&task.id));
            if already.contains(&task.id) {
                set.resolved.insert(task.id);
                continue;
            }
            let open = dag
                .dependencies_of(&task.id)
                .iter()
                .filter(|dep| !already.contains(dep))
                .count();
            set.scores.insert(task.id, task.priority_score());
            set.remaining.insert(task.id, open);
            if open == 0 {
                set.queue.push(ReadyEntry {
                    score: task.priority_score(),
                    id: task.id,
                });
            }
        }
        set
    }

    /// Take the next ready task: highest priority, then lowest id.
    pub fn pop(&mut self) -> Option<TaskId> {
        let entry = self.queue.pop()?;
        self.remaining.remove(&entry.id);
        Some(entry.id)
    }

    /// Mark a task terminal and return the dependents that became ready.
    ///
    /// Resolving the same task twice is a no-op.
    pub fn resolve(&mut self, id: TaskId) -> Vec<TaskId> {
        if !self.resolved.insert(id) {
            return Vec::new();
        }
        let mut unlocked = Vec::new();
        let dependents = self.dependents.get(&id).cloned().unwrap_or_default();
        for dependent in dependents {
            let Some(count) = self.remaining.get_mut(&dependent) else {
                continue;
            };
            *count = count.saturating_sub(1);
            if *count == 0 {
                let score = self.scores.get(&dependent).copied().unwrap_or_default();
                self.queue.push(ReadyEntry {
                    score,
                    id: dependent,
                });
                unlocked.push(dependent);
            }
        }
        unlocked
    }

    /// Number of tasks currently waiting in the ready queue.
    pub fn ready_len(&self) -> usize {
        self.queue.len()
    }

    /// Check whether a task has been resolved.
    pub fn is_resolved(&self, id: &TaskId) -> bool {
        self.resolved.contains(id)
    }

    /// Tasks waiting in the ready queue, ascending.
    pub fn queued(&self) -> Vec<TaskId> {
        let mut ids: Vec<TaskId> = self.queue.iter().map(|entry| entry.id).collect();
        ids.sort();
        ids
    }

    /// Tasks not yet handed out by `pop`, ascending.
    pub fn undispatched(&self) -> Vec<TaskId> {
        let mut ids: Vec<TaskId> = self.remaining.keys().copied().collect();
        ids.sort();
        ids
    }
}
