use crate::error::ValidationError;
use crate::types::{TaskId, TaskSpec, Workflow, WorkflowDefinition, WorkflowId};
use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use std::collections::{BTreeSet, HashMap};

/// Dependency graph of a workflow that passed validation.
///
/// Tasks are addressed by their position in the definition, so node `i`
/// is always `definition.tasks[i]`. Both adjacency directions are built
/// once here and reused by every scheduling pass.
#[derive(Debug, Clone)]
pub struct WorkflowDag {
    task_ids: Vec<TaskId>,
    indices: HashMap<TaskId, usize>,
    dependencies: Vec<Vec<usize>>,
    dependents: Vec<Vec<usize>>,
    topo_order: Vec<usize>,
}

impl WorkflowDag {
    /// Check a definition for structural correctness.
    ///
    /// Rejects empty workflows, duplicate ids, dependencies on undefined
    /// tasks and cycles. Pure: nothing outside the definition is read.
    pub fn validate(definition: &WorkflowDefinition) -> Result<Self, ValidationError> {
        if definition.tasks.is_empty() {
            return Err(ValidationError::EmptyWorkflow);
        }

        let mut graph: DiGraph<TaskId, ()> = DiGraph::new();
        let mut indices = HashMap::with_capacity(definition.tasks.len());

        // Add all tasks as nodes
        for task in &definition.tasks {
            let node = graph.add_node(task.id.clone());
            if indices.insert(task.id.clone(), node.index()).is_some() {
                return Err(ValidationError::DuplicateTaskId(task.id.clone()));
            }
        }

        // Add dependency edges (dep -> task)
        let mut dependencies = Vec::with_capacity(definition.tasks.len());
        for (idx, task) in definition.tasks.iter().enumerate() {
            let mut deps = BTreeSet::new();
            for dep_id in &task.depends_on {
                let dep_idx = *indices.get(dep_id).ok_or_else(|| {
                    ValidationError::UnknownDependency {
                        task: task.id.clone(),
                        dependency: dep_id.clone(),
                    }
                })?;
                if deps.insert(dep_idx) {
                    graph.add_edge(NodeIndex::new(dep_idx), NodeIndex::new(idx), ());
                }
            }
            dependencies.push(deps.into_iter().collect::<Vec<_>>());
        }

        let topo_order = kahn_order(&graph)?;

        let mut dependents = vec![Vec::new(); definition.tasks.len()];
        for (idx, deps) in dependencies.iter().enumerate() {
            for &dep in deps {
                dependents[dep].push(idx);
            }
        }

        Ok(Self {
            task_ids: definition.tasks.iter().map(|t| t.id.clone()).collect(),
            indices,
            dependencies,
            dependents,
            topo_order,
        })
    }

    pub fn len(&self) -> usize {
        self.task_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.task_ids.is_empty()
    }

    pub fn index_of(&self, task_id: &TaskId) -> Option<usize> {
        self.indices.get(task_id).copied()
    }

    pub fn task_id(&self, idx: usize) -> &TaskId {
        &self.task_ids[idx]
    }

    /// Direct dependencies of a task, by definition index
    pub fn dependencies(&self, idx: usize) -> &[usize] {
        &self.dependencies[idx]
    }

    /// Tasks that directly depend on the given task
    pub fn dependents(&self, idx: usize) -> &[usize] {
        &self.dependents[idx]
    }

    /// One valid execution order; ties are broken by definition order.
    ///
    /// Only a hint: tasks that are eligible together may run in any order.
    pub fn topological_order(&self) -> Vec<&TaskId> {
        self.topo_order.iter().map(|&i| &self.task_ids[i]).collect()
    }

    /// Same order as [`Self::topological_order`], by definition index
    pub fn topological_indices(&self) -> &[usize] {
        &self.topo_order
    }
}

/// Kahn's algorithm. Nodes still holding in-degree once the queue drains
/// sit on or behind a cycle; the cycle members themselves are the
/// non-trivial strongly connected components.
fn kahn_order(graph: &DiGraph<TaskId, ()>) -> Result<Vec<usize>, ValidationError> {
    let mut in_degree: Vec<usize> = graph
        .node_indices()
        .map(|n| graph.neighbors_directed(n, Direction::Incoming).count())
        .collect();

    let mut ready: BTreeSet<usize> = in_degree
        .iter()
        .enumerate()
        .filter(|&(_, &d)| d == 0)
        .map(|(i, _)| i)
        .collect();

    let mut order = Vec::with_capacity(in_degree.len());
    while let Some(idx) = ready.pop_first() {
        order.push(idx);
        for next in graph.neighbors_directed(NodeIndex::new(idx), Direction::Outgoing) {
            let degree = &mut in_degree[next.index()];
            *degree -= 1;
            if *degree == 0 {
                ready.insert(next.index());
            }
        }
    }

    if order.len() == graph.node_count() {
        return Ok(order);
    }

    let mut involved: Vec<usize> = tarjan_scc(graph)
        .into_iter()
        .filter(|scc| scc.len() > 1 || graph.contains_edge(scc[0], scc[0]))
        .flatten()
        .map(|n| n.index())
        .collect();
    involved.sort_unstable();

    Err(ValidationError::CyclicDependency(
        involved.into_iter().map(|i| graph[NodeIndex::new(i)].clone()).collect(),
    ))
}

/// A stored workflow together with its validated graph.
///
/// Shared read-only between every job created from this version.
#[derive(Debug, Clone)]
pub struct ValidatedWorkflow {
    workflow: Workflow,
    dag: WorkflowDag,
}

impl ValidatedWorkflow {
    pub fn new(workflow: Workflow) -> Result<Self, ValidationError> {
        let dag = WorkflowDag::validate(&workflow.definition)?;
        Ok(Self { workflow, dag })
    }

    pub fn id(&self) -> WorkflowId {
        self.workflow.id
    }

    pub fn version(&self) -> u32 {
        self.workflow.version
    }

    pub fn workflow(&self) -> &Workflow {
        &self.workflow
    }

    pub fn dag(&self) -> &WorkflowDag {
        &self.dag
    }

    pub fn tasks(&self) -> &[TaskSpec] {
        &self.workflow.definition.tasks
    }

    pub fn task(&self, idx: usize) -> &TaskSpec {
        &self.workflow.definition.tasks[idx]
    }
}
