//! Task definitions and the dependency graph a run walks.
//!
//! A [`TaskGraph`] is validated once at construction (no duplicate ids, no
//! dangling dependencies, no cycles) and is read-only afterwards. Ordering is
//! deterministic: among tasks whose dependencies are satisfied, the one with
//! more direct dependents goes first, then the one declared earlier.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::error::GraphIntegrityError;
use crate::ids::TaskId;

/// What happens to a run when a task keeps failing after all retries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Criticality {
    /// Permanent failure aborts the whole run.
    Critical,
    /// Permanent failure is logged, the task is marked skipped and the run
    /// continues.
    #[default]
    BestEffort,
}

/// Static descriptor of one unit of work in the graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskDefinition {
    /// Stable task identifier.
    pub id: TaskId,

    /// Human-readable name.
    pub name: String,

    /// Role (agent) that executes the task.
    pub owning_role: String,

    /// Description with `{placeholder}`s resolved from run parameters.
    pub description_template: String,

    /// Tasks that must complete before this one becomes ready.
    pub dependency_ids: Vec<TaskId>,

    /// Failure policy after retries are exhausted.
    pub criticality: Criticality,
}

impl TaskDefinition {
    /// Create a best-effort task with no dependencies.
    pub fn new(id: impl Into<TaskId>, owning_role: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.as_str().to_string(),
            id,
            owning_role: owning_role.into(),
            description_template: String::new(),
            dependency_ids: Vec::new(),
            criticality: Criticality::BestEffort,
        }
    }

    /// Builder method to set the display name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Builder method to set the description template.
    pub fn with_description(mut self, template: impl Into<String>) -> Self {
        self.description_template = template.into();
        self
    }

    /// Builder method to set dependencies.
    pub fn with_dependencies<I, T>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<TaskId>,
    {
        self.dependency_ids = deps.into_iter().map(Into::into).collect();
        self
    }

    /// Builder method to set criticality.
    pub fn with_criticality(mut self, criticality: Criticality) -> Self {
        self.criticality = criticality;
        self
    }

    /// Returns true if a permanent failure of this task aborts the run.
    pub fn is_critical(&self) -> bool {
        self.criticality == Criticality::Critical
    }

    /// Render the description, replacing `{key}` with `params[key]`.
    ///
    /// Placeholders without a matching parameter are kept verbatim.
    pub fn render_description(&self, params: &HashMap<String, String>) -> String {
        let template = self.description_template.as_str();
        let mut out = String::with_capacity(template.len());
        let mut rest = template;

        while let Some(start) = rest.find('{') {
            out.push_str(&rest[..start]);
            let after = &rest[start + 1..];
            let Some(end) = after.find('}') else {
                out.push_str(&rest[start..]);
                rest = "";
                break;
            };
            let key = &after[..end];
            match params.get(key) {
                Some(value) => out.push_str(value),
                None => {
                    out.push('{');
                    out.push_str(key);
                    out.push('}');
                }
            }
            rest = &after[end + 1..];
        }

        out.push_str(rest);
        out
    }
}

/// Heap entry for ready tasks. The greatest entry runs first.
#[derive(Debug, PartialEq, Eq)]
struct Ready {
    fan_in: usize,
    position: usize,
}

impl Ord for Ready {
    fn cmp(&self, other: &Self) -> Ordering {
        self.fan_in
            .cmp(&other.fan_in)
            .then_with(|| other.position.cmp(&self.position))
    }
}

impl PartialOrd for Ready {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// The full, validated set of task definitions for a run type.
#[derive(Debug, Clone)]
pub struct TaskGraph {
    tasks: Vec<TaskDefinition>,
    index: HashMap<TaskId, usize>,
    dependents: Vec<Vec<usize>>,
    order: Vec<TaskId>,
}

impl TaskGraph {
    /// Validate the definitions and build the graph.
    ///
    /// Duplicate dependency entries are collapsed. Fails on duplicate task
    /// ids, unknown dependencies and cycles.
    pub fn new(tasks: Vec<TaskDefinition>) -> Result<Self, GraphIntegrityError> {
        if tasks.is_empty() {
            return Err(GraphIntegrityError::Empty);
        }

        let mut index = HashMap::with_capacity(tasks.len());
        for (position, task) in tasks.iter().enumerate() {
            if index.insert(task.id.clone(), position).is_some() {
                return Err(GraphIntegrityError::DuplicateTask(task.id.clone()));
            }
        }

        let mut tasks = tasks;
        for task in &mut tasks {
            let mut seen = HashSet::new();
            task.dependency_ids.retain(|dep| seen.insert(dep.clone()));
        }

        let mut dependents = vec![Vec::new(); tasks.len()];
        for (position, task) in tasks.iter().enumerate() {
            for dep in &task.dependency_ids {
                let Some(&dep_position) = index.get(dep) else {
                    return Err(GraphIntegrityError::UnknownDependency {
                        task: task.id.clone(),
                        dependency: dep.clone(),
                    });
                };
                dependents[dep_position].push(position);
            }
        }

        let mut graph = Self {
            tasks,
            index,
            dependents,
            order: Vec::new(),
        };

        if let Some(cycle) = graph.find_cycle() {
            return Err(GraphIntegrityError::Cycle { cycle });
        }

        graph.order = graph.topological_order();
        Ok(graph)
    }

    /// Tasks in an order where every task follows all of its dependencies.
    ///
    /// Ties are broken by descending number of direct dependents, then by
    /// declaration order.
    pub fn resolve_order(&self) -> &[TaskId] {
        &self.order
    }

    /// Tasks not yet completed whose dependencies are all completed, highest
    /// priority first.
    pub fn ready_tasks(&self, completed: &HashSet<TaskId>) -> Vec<TaskId> {
        let mut ready: Vec<Ready> = self
            .tasks
            .iter()
            .enumerate()
            .filter(|(_, task)| !completed.contains(&task.id))
            .filter(|(_, task)| task.dependency_ids.iter().all(|d| completed.contains(d)))
            .map(|(position, _)| Ready {
                fan_in: self.dependents[position].len(),
                position,
            })
            .collect();

        ready.sort_by(|a, b| b.cmp(a));
        ready
            .into_iter()
            .map(|r| self.tasks[r.position].id.clone())
            .collect()
    }

    /// Highest-priority ready task, if any.
    pub fn next_ready(&self, completed: &HashSet<TaskId>) -> Option<&TaskDefinition> {
        self.ready_tasks(completed)
            .first()
            .and_then(|id| self.get(id))
    }

    /// Look up a task definition.
    pub fn get(&self, id: &TaskId) -> Option<&TaskDefinition> {
        self.index.get(id).map(|&position| &self.tasks[position])
    }

    /// Returns true if the graph defines this task.
    pub fn contains(&self, id: &TaskId) -> bool {
        self.index.contains_key(id)
    }

    /// Task definitions in declaration order.
    pub fn tasks(&self) -> &[TaskDefinition] {
        &self.tasks
    }

    /// Number of tasks.
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Always false for a constructed graph; present for API symmetry.
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Number of tasks that directly depend on `id`.
    pub fn dependents_count(&self, id: &TaskId) -> usize {
        self.index
            .get(id)
            .map(|&position| self.dependents[position].len())
            .unwrap_or(0)
    }

    /// Length of the longest prefix of `ids` that could have been produced by
    /// executing this graph: every id is known, appears once, and all of its
    /// dependencies appear earlier in the prefix.
    pub fn consistent_prefix_len(&self, ids: &[TaskId]) -> usize {
        let mut seen: HashSet<&TaskId> = HashSet::with_capacity(ids.len());
        for (n, id) in ids.iter().enumerate() {
            let Some(task) = self.get(id) else {
                return n;
            };
            if seen.contains(id) || !task.dependency_ids.iter().all(|d| seen.contains(d)) {
                return n;
            }
            seen.insert(id);
        }
        ids.len()
    }

    fn find_cycle(&self) -> Option<Vec<TaskId>> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Unvisited,
            InProgress,
            Done,
        }

        fn visit(
            graph: &TaskGraph,
            position: usize,
            marks: &mut [Mark],
            path: &mut Vec<usize>,
        ) -> Option<Vec<TaskId>> {
            marks[position] = Mark::InProgress;
            path.push(position);

            for dep in &graph.tasks[position].dependency_ids {
                let dep_position = graph.index[dep];
                match marks[dep_position] {
                    Mark::InProgress => {
                        let start = path.iter().position(|&p| p == dep_position)?;
                        let mut cycle: Vec<TaskId> = path[start..]
                            .iter()
                            .map(|&p| graph.tasks[p].id.clone())
                            .collect();
                        cycle.push(graph.tasks[dep_position].id.clone());
                        return Some(cycle);
                    }
                    Mark::Unvisited => {
                        if let Some(cycle) = visit(graph, dep_position, marks, path) {
                            return Some(cycle);
                        }
                    }
                    Mark::Done => {}
                }
            }

            path.pop();
            marks[position] = Mark::Done;
            None
        }

        let mut marks = vec![Mark::Unvisited; self.tasks.len()];
        let mut path = Vec::new();
        for position in 0..self.tasks.len() {
            if marks[position] == Mark::Unvisited {
                if let Some(cycle) = visit(self, position, &mut marks, &mut path) {
                    return Some(cycle);
                }
            }
        }
        None
    }

    fn topological_order(&self) -> Vec<TaskId> {
        let mut remaining: Vec<usize> = self
            .tasks
            .iter()
            .map(|task| task.dependency_ids.len())
            .collect();

        let mut heap: BinaryHeap<Ready> = remaining
            .iter()
            .enumerate()
            .filter(|(_, &count)| count == 0)
            .map(|(position, _)| Ready {
                fan_in: self.dependents[position].len(),
                position,
            })
            .collect();

        let mut order = Vec::with_capacity(self.tasks.len());
        while let Some(Ready { position, .. }) = heap.pop() {
            order.push(self.tasks[position].id.clone());
            for &dependent in &self.dependents[position] {
                remaining[dependent] -= 1;
                if remaining[dependent] == 0 {
                    heap.push(Ready {
                        fan_in: self.dependents[dependent].len(),
                        position: dependent,
                    });
                }
            }
        }
        order
    }
}
