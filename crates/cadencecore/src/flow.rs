use crate::{TaskId, TaskSignature, ValidationError, Value};
use petgraph::algo::toposort;
use petgraph::graph::DiGraph;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Lookup of task signatures used while validating flows
pub trait TaskCatalog {
    fn signature(&self, task: &str) -> Option<TaskSignature>;
}

impl TaskCatalog for HashMap<TaskId, TaskSignature> {
    fn signature(&self, task: &str) -> Option<TaskSignature> {
        self.get(task).copied()
    }
}

/// Where a step takes its input from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputRef {
    /// A run parameter by key
    Param(String),
    /// The output of an earlier step
    Step(String),
    Literal(Value),
}

impl InputRef {
    fn describe(&self) -> String {
        match self {
            InputRef::Param(key) => format!("param '{}'", key),
            InputRef::Step(name) => format!("step '{}'", name),
            InputRef::Literal(value) => format!("literal {}", value.kind()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    /// One invocation with one input
    #[default]
    Scalar,
    /// One invocation per element of a sequence input, joined in input order
    Mapped,
}

/// One step of a flow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepSpec {
    pub name: String,
    pub task: TaskId,
    #[serde(default)]
    pub kind: StepKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<InputRef>,
}

impl StepSpec {
    pub fn scalar(name: impl Into<String>, task: impl Into<TaskId>) -> Self {
        Self {
            name: name.into(),
            task: task.into(),
            kind: StepKind::Scalar,
            input: None,
        }
    }

    pub fn mapped(name: impl Into<String>, task: impl Into<TaskId>) -> Self {
        Self {
            kind: StepKind::Mapped,
            ..Self::scalar(name, task)
        }
    }

    pub fn with_input(mut self, input: InputRef) -> Self {
        self.input = Some(input);
        self
    }

    pub fn from_param(self, key: impl Into<String>) -> Self {
        self.with_input(InputRef::Param(key.into()))
    }

    pub fn from_step(self, step: impl Into<String>) -> Self {
        self.with_input(InputRef::Step(step.into()))
    }

    pub fn is_mapped(&self) -> bool {
        self.kind == StepKind::Mapped
    }
}

/// Unvalidated flow, as written in manifests
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowDefinition {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub steps: Vec<StepSpec>,
}

impl FlowDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: None,
            description: None,
            steps: Vec::new(),
        }
    }

    pub fn step(mut self, step: StepSpec) -> Self {
        self.steps.push(step);
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// Validated, immutable flow graph
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FlowGraph {
    name: String,
    version: Option<String>,
    description: Option<String>,
    steps: Vec<StepSpec>,
}

impl FlowGraph {
    /// Validate a definition against the registered tasks.
    pub fn define(
        definition: FlowDefinition,
        catalog: &dyn TaskCatalog,
    ) -> Result<Self, ValidationError> {
        let FlowDefinition {
            name,
            version,
            description,
            steps,
        } = definition;

        if name.trim().is_empty() {
            return Err(ValidationError::InvalidFlow("flow name is empty".to_string()));
        }
        if steps.is_empty() {
            return Err(ValidationError::InvalidFlow(format!("flow '{}' has no steps", name)));
        }

        let mut positions = HashMap::new();
        for (idx, step) in steps.iter().enumerate() {
            if step.name.trim().is_empty() {
                return Err(ValidationError::InvalidFlow(format!("step #{} has no name", idx)));
            }
            if positions.insert(step.name.as_str(), idx).is_some() {
                return Err(ValidationError::InvalidFlow(format!(
                    "duplicate step name '{}'",
                    step.name
                )));
            }
            if catalog.signature(&step.task).is_none() {
                return Err(ValidationError::UnknownTask(step.task.clone()));
            }
        }

        check_dependencies(&steps, &positions)?;

        for step in &steps {
            check_input(step, &steps, &positions, catalog)?;
        }

        Ok(Self {
            name,
            version,
            description,
            steps,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn steps(&self) -> &[StepSpec] {
        &self.steps
    }

    pub fn find_step(&self, name: &str) -> Option<&StepSpec> {
        self.steps.iter().find(|s| s.name == name)
    }
}

/// Steps may only read steps declared before them, and the read graph
/// must be acyclic.
fn check_dependencies(
    steps: &[StepSpec],
    positions: &HashMap<&str, usize>,
) -> Result<(), ValidationError> {
    let mut graph = DiGraph::<usize, ()>::new();
    let nodes: Vec<_> = (0..steps.len()).map(|idx| graph.add_node(idx)).collect();

    for (idx, step) in steps.iter().enumerate() {
        if let Some(InputRef::Step(source)) = &step.input {
            let source_idx = positions.get(source.as_str()).copied().ok_or_else(|| {
                ValidationError::InvalidFlow(format!(
                    "step '{}' reads unknown step '{}'",
                    step.name, source
                ))
            })?;
            graph.add_edge(nodes[source_idx], nodes[idx], ());
        }
    }

    if let Err(cycle) = toposort(&graph, None) {
        let idx = graph[cycle.node_id()];
        return Err(ValidationError::CyclicDependency(steps[idx].name.clone()));
    }

    for (idx, step) in steps.iter().enumerate() {
        if let Some(InputRef::Step(source)) = &step.input {
            if positions[source.as_str()] > idx {
                return Err(ValidationError::InvalidFlow(format!(
                    "step '{}' reads step '{}' which runs after it",
                    step.name, source
                )));
            }
        }
    }

    Ok(())
}

fn check_input(
    step: &StepSpec,
    steps: &[StepSpec],
    positions: &HashMap<&str, usize>,
    catalog: &dyn TaskCatalog,
) -> Result<(), ValidationError> {
    let signature = catalog
        .signature(&step.task)
        .ok_or_else(|| ValidationError::UnknownTask(step.task.clone()))?;

    let mismatch = |value: &Value| {
        ValidationError::InvalidFlow(format!(
            "step '{}': task '{}' expects {}, literal is {}",
            step.name,
            step.task,
            signature.input,
            value.kind()
        ))
    };

    match (step.kind, &step.input) {
        (StepKind::Scalar, Some(InputRef::Literal(value))) => {
            if !signature.accepts(value) {
                return Err(mismatch(value));
            }
        }
        (StepKind::Scalar, _) => {}
        (StepKind::Mapped, None) => {
            return Err(ValidationError::InvalidFlow(format!(
                "mapped step '{}' has no input",
                step.name
            )));
        }
        (StepKind::Mapped, Some(InputRef::Param(_))) => {}
        (StepKind::Mapped, Some(InputRef::Literal(value))) => {
            let items = value.as_array().ok_or_else(|| ValidationError::NotASequence {
                step: step.name.clone(),
                source_desc: InputRef::Literal(value.clone()).describe(),
            })?;
            if let Some(bad) = items.iter().find(|item| !signature.accepts(item)) {
                return Err(mismatch(bad));
            }
        }
        (StepKind::Mapped, Some(input @ InputRef::Step(source))) => {
            let source_step = &steps[positions[source.as_str()]];
            let produces_sequence = source_step.is_mapped()
                || catalog
                    .signature(&source_step.task)
                    .map(|s| s.output.is_sequence_like())
                    .unwrap_or(false);
            if !produces_sequence {
                return Err(ValidationError::NotASequence {
                    step: step.name.clone(),
                    source_desc: input.describe(),
                });
            }
        }
    }

    Ok(())
}
