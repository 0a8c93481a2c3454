// Execution Graph (DAG) Builder
// Builds the job dependency graph with expanded instances and a stable topological order

use super::matrix::{JobInstance, MatrixExpander};
use crate::parser::error::ConfigError;
use crate::pipeline::models::{JobGraph, JobTemplate};

use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

/// Error type for graph operations
#[derive(Debug, Clone, Error, PartialEq)]
pub enum GraphError {
    /// Jobs left over after the topological sort
    #[error("dependency cycle detected between jobs: {}", jobs.join(", "))]
    Cycle { jobs: Vec<String> },

    #[error("job '{job}' depends on unknown job '{dependency}'")]
    UnknownDependency { job: String, dependency: String },

    #[error("unknown job '{0}'")]
    UnknownJob(String),

    #[error("job '{0}' is declared more than once")]
    DuplicateJob(String),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Execution graph of jobs and their instances
#[derive(Debug, Clone)]
pub struct ExecutionGraph {
    pub name: String,
    /// Run-level environment
    pub env: BTreeMap<String, String>,
    pub source_dir: PathBuf,
    /// Nodes in declaration order
    nodes: Vec<JobNode>,
    /// Quick lookup of node index by job id
    indices: HashMap<String, usize>,
    /// Node indices in topological order, declaration order as tie-break
    order: Vec<usize>,
}

/// A node representing a job in the execution graph
#[derive(Debug, Clone)]
pub struct JobNode {
    pub template: Arc<JobTemplate>,
    /// Ids of jobs this job depends on
    pub dependencies: Vec<String>,
    /// Expanded instances in matrix order
    pub instances: Vec<JobInstance>,
}

impl JobNode {
    pub fn id(&self) -> &str {
        &self.template.id
    }
}

impl ExecutionGraph {
    /// Build an execution graph from a loaded job graph
    pub fn build(graph: &JobGraph) -> Result<Self, GraphError> {
        let mut execution = Self::from_templates(graph.jobs.iter().cloned())?;
        execution.name = graph.name.clone();
        execution.env = graph.env.clone();
        execution.source_dir = graph.source_dir.clone();
        Ok(execution)
    }

    /// Build from bare templates (declaration order is iteration order)
    pub fn from_templates<I>(templates: I) -> Result<Self, GraphError>
    where
        I: IntoIterator<Item = JobTemplate>,
    {
        let mut nodes = Vec::new();
        for template in templates {
            let template = Arc::new(template);
            let instances = MatrixExpander::expand(&template)?;
            nodes.push(JobNode {
                dependencies: template.needs.clone(),
                template,
                instances,
            });
        }

        Self::from_nodes(nodes)
    }

    fn from_nodes(nodes: Vec<JobNode>) -> Result<Self, GraphError> {
        let mut indices = HashMap::with_capacity(nodes.len());
        for (i, node) in nodes.iter().enumerate() {
            if indices.insert(node.id().to_string(), i).is_some() {
                return Err(GraphError::DuplicateJob(node.id().to_string()));
            }
        }

        for node in &nodes {
            for dependency in &node.dependencies {
                if !indices.contains_key(dependency) {
                    return Err(GraphError::UnknownDependency {
                        job: node.id().to_string(),
                        dependency: dependency.clone(),
                    });
                }
            }
        }

        let order = Self::sort(&nodes, &indices)?;

        Ok(Self {
            name: String::new(),
            env: BTreeMap::new(),
            source_dir: PathBuf::from("."),
            nodes,
            indices,
            order,
        })
    }

    /// Kahn's algorithm; the smallest declaration index among ready nodes goes first
    fn sort(nodes: &[JobNode], indices: &HashMap<String, usize>) -> Result<Vec<usize>, GraphError> {
        let mut in_degree = vec![0usize; nodes.len()];
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); nodes.len()];

        for (i, node) in nodes.iter().enumerate() {
            let unique: HashSet<&String> = node.dependencies.iter().collect();
            for dependency in unique {
                let dep = indices[dependency];
                dependents[dep].push(i);
                in_degree[i] += 1;
            }
        }

        let mut ready: BTreeSet<usize> = (0..nodes.len()).filter(|&i| in_degree[i] == 0).collect();
        let mut order = Vec::with_capacity(nodes.len());

        while let Some(current) = ready.pop_first() {
            order.push(current);
            for &next in &dependents[current] {
                in_degree[next] -= 1;
                if in_degree[next] == 0 {
                    ready.insert(next);
                }
            }
        }

        if order.len() < nodes.len() {
            let jobs = (0..nodes.len())
                .filter(|&i| in_degree[i] > 0)
                .map(|i| nodes[i].id().to_string())
                .collect();
            return Err(GraphError::Cycle { jobs });
        }

        Ok(order)
    }

    /// Restrict the graph to the given jobs and their transitive dependencies
    pub fn select(&self, jobs: &[String]) -> Result<Self, GraphError> {
        let mut keep = HashSet::new();
        let mut stack = Vec::new();

        for job in jobs {
            let index = *self
                .indices
                .get(job)
                .ok_or_else(|| GraphError::UnknownJob(job.clone()))?;
            stack.push(index);
        }

        while let Some(index) = stack.pop() {
            if keep.insert(index) {
                for dependency in &self.nodes[index].dependencies {
                    stack.push(self.indices[dependency]);
                }
            }
        }

        let nodes = self
            .nodes
            .iter()
            .enumerate()
            .filter(|(i, _)| keep.contains(i))
            .map(|(_, node)| node.clone())
            .collect();

        let mut selected = Self::from_nodes(nodes)?;
        selected.name = self.name.clone();
        selected.env = self.env.clone();
        selected.source_dir = self.source_dir.clone();
        Ok(selected)
    }

    /// Jobs in topological order
    pub fn topological_order(&self) -> Vec<&JobNode> {
        self.order.iter().map(|&i| &self.nodes[i]).collect()
    }

    /// Jobs in declaration order
    pub fn nodes(&self) -> &[JobNode] {
        &self.nodes
    }

    /// Position of a job in the topological order
    pub fn position(&self, id: &str) -> Option<usize> {
        let index = self.indices.get(id)?;
        self.order.iter().position(|i| i == index)
    }

    /// Get jobs that can run in parallel (no dependencies between them)
    pub fn parallel_levels(&self) -> Vec<Vec<&JobNode>> {
        let mut levels: Vec<Vec<&JobNode>> = Vec::new();
        let mut assigned: HashMap<&str, usize> = HashMap::new();

        for node in self.topological_order() {
            let level = node
                .dependencies
                .iter()
                .filter_map(|dep| assigned.get(dep.as_str()))
                .max()
                .map(|l| l + 1)
                .unwrap_or(0);

            assigned.insert(node.id(), level);

            if level >= levels.len() {
                levels.resize(level + 1, Vec::new());
            }
            levels[level].push(node);
        }

        levels
    }

    /// Get a job by id
    pub fn get(&self, id: &str) -> Option<&JobNode> {
        self.indices.get(id).map(|&idx| &self.nodes[idx])
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn instance_count(&self) -> usize {
        self.nodes.iter().map(|n| n.instances.len()).sum()
    }

    /// Dry-run view of what would be executed
    pub fn plan(&self) -> ExecutionPlan {
        let levels = self
            .parallel_levels()
            .into_iter()
            .map(|level| {
                level
                    .into_iter()
                    .map(|node| PlannedJob {
                        id: node.id().to_string(),
                        name: node.template.display_name.clone(),
                        needs: node.dependencies.clone(),
                        instances: node.instances.iter().map(|i| i.id.clone()).collect(),
                        sidecars: node
                            .template
                            .sidecars
                            .iter()
                            .map(|s| s.image_ref())
                            .collect(),
                    })
                    .collect()
            })
            .collect();

        ExecutionPlan {
            name: self.name.clone(),
            levels,
        }
    }
}

/// Jobs grouped by dependency level
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionPlan {
    pub name: String,
    pub levels: Vec<Vec<PlannedJob>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PlannedJob {
    pub id: String,
    pub name: Option<String>,
    pub needs: Vec<String>,
    pub instances: Vec<String>,
    pub sidecars: Vec<String>,
}

impl ExecutionPlan {
    pub fn job_count(&self) -> usize {
        self.levels.iter().map(Vec::len).sum()
    }

    pub fn instance_count(&self) -> usize {
        self.levels
            .iter()
            .flatten()
            .map(|job| job.instances.len())
            .sum()
    }
}

impl fmt::Display for ExecutionPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Plan for '{}': {} job(s), {} instance(s)",
            self.name,
            self.job_count(),
            self.instance_count()
        )?;

        for (level, jobs) in self.levels.iter().enumerate() {
            writeln!(f, "\nLevel {}:", level + 1)?;
            for job in jobs {
                write!(f, "  {}", job.id)?;
                if !job.needs.is_empty() {
                    write!(f, " (needs: {})", job.needs.join(", "))?;
                }
                writeln!(f)?;
                for sidecar in &job.sidecars {
                    writeln!(f, "    service {}", sidecar)?;
                }
                if job.instances.len() > 1 {
                    for instance in &job.instances {
                        writeln!(f, "    - {}", instance)?;
                    }
                }
            }
        }

        Ok(())
    }
}
