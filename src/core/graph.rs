//! Read-only view of a registered pipeline.
//!
//! Operations become nodes connected to the artifact slots (kind plus
//! label) they consume and produce. The graph serializes to JSON and renders
//! as a Mermaid flowchart.

use serde::{Deserialize, Serialize};

use crate::domain::ArtifactKind;

use super::operation::{Multiplicity, OperationRegistry, OutputSpec, ParamSpec, Scope};
use super::repository::{ArtifactQuery, Repository, RepositoryError};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationNode {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub inputs: Vec<ParamSpec>,
    pub output: OutputSpec,
    pub scope: Scope,
}

/// A slot artifacts of one kind and label land in
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactNode {
    pub id: String,
    pub kind: ArtifactKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,

    /// Operation writing this slot; none for external inputs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub producer: Option<String>,

    #[serde(default)]
    pub consumers: Vec<String>,

    /// Stored artifacts in this slot, once counted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<usize>,
}

impl ArtifactNode {
    fn new(kind: ArtifactKind, label: Option<&str>, producer: Option<&str>) -> Self {
        let id = match label {
            Some(label) => format!("{}_{}", kind, node_id(label)),
            None => kind.to_string(),
        };
        Self {
            id,
            kind,
            label: label.map(str::to_string),
            producer: producer.map(str::to_string),
            consumers: Vec::new(),
            count: None,
        }
    }

    fn satisfies(&self, param: &ParamSpec) -> bool {
        self.kind == param.kind
            && match (&param.label, &self.label) {
                (None, _) => true,
                (Some(wanted), Some(label)) => wanted == label,
                (Some(_), None) => false,
            }
    }

    fn display_label(&self) -> String {
        let mut text = format!("{}[{}]", self.kind, self.label.as_deref().unwrap_or(""));
        if let Some(count) = self.count {
            text.push_str(&format!(" ({})", count));
        }
        text
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Edge {
    pub from: String,
    pub to: String,
    pub multiplicity: Multiplicity,
}

/// Operations, artifact slots and the edges between them
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineGraph {
    pub operations: Vec<OperationNode>,
    pub artifacts: Vec<ArtifactNode>,
    pub edges: Vec<Edge>,
}

impl PipelineGraph {
    pub fn from_registry(registry: &OperationRegistry) -> Self {
        let mut graph = Self::default();

        for operation in registry.operations() {
            graph.artifacts.push(ArtifactNode::new(
                operation.output.kind,
                Some(&operation.output.label),
                Some(&operation.name),
            ));
        }

        for operation in registry.operations() {
            let op_id = format!("op_{}", node_id(&operation.name));

            for param in &operation.inputs {
                let mut matched = false;
                for node in graph.artifacts.iter_mut().filter(|n| n.satisfies(param)) {
                    matched = true;
                    if !node.consumers.contains(&operation.name) {
                        node.consumers.push(operation.name.clone());
                    }
                    graph.edges.push(Edge {
                        from: node.id.clone(),
                        to: op_id.clone(),
                        multiplicity: param.multiplicity,
                    });
                }

                if !matched {
                    let mut node = ArtifactNode::new(param.kind, param.label.as_deref(), None);
                    node.consumers.push(operation.name.clone());
                    graph.edges.push(Edge {
                        from: node.id.clone(),
                        to: op_id.clone(),
                        multiplicity: param.multiplicity,
                    });
                    graph.artifacts.push(node);
                }
            }

            graph.edges.push(Edge {
                from: op_id.clone(),
                to: format!("{}_{}", operation.output.kind, node_id(&operation.output.label)),
                multiplicity: operation.output.multiplicity,
            });

            graph.operations.push(OperationNode {
                id: op_id,
                name: operation.name.clone(),
                description: operation.description.clone(),
                inputs: operation.inputs.clone(),
                output: operation.output.clone(),
                scope: operation.scope,
            });
        }

        graph
    }

    /// Fill in how many artifacts each slot currently holds
    pub async fn with_counts(mut self, repository: &dyn Repository) -> Result<Self, RepositoryError> {
        for node in &mut self.artifacts {
            let query = ArtifactQuery::kind(node.kind).with_optional_label(node.label.as_deref());
            node.count = Some(repository.query(&query).await?.len());
        }
        Ok(self)
    }

    /// Render as a Mermaid flowchart
    pub fn to_mermaid(&self) -> String {
        let mut lines = vec!["flowchart TD".to_string()];

        let (inputs, outputs): (Vec<_>, Vec<_>) =
            self.artifacts.iter().partition(|n| n.producer.is_none());

        for node in &inputs {
            lines.push(format!(
                "    {}@{{ shape: doc, label: \"{}\" }}",
                node.id,
                node.display_label()
            ));
        }
        lines.push(String::new());

        for op in &self.operations {
            lines.push(format!("    {}@{{ shape: rect, label: \"{}\" }}", op.id, op.name));
        }
        lines.push(String::new());

        for node in &outputs {
            lines.push(format!(
                "    {}@{{ shape: doc, label: \"{}\" }}",
                node.id,
                node.display_label()
            ));
        }
        lines.push(String::new());

        for edge in &self.edges {
            let arrow = match edge.multiplicity {
                Multiplicity::One => "-->",
                Multiplicity::Many => "-- * -->",
            };
            lines.push(format!("    {} {} {}", edge.from, arrow, edge.to));
        }

        lines.join("\n")
    }
}

/// Mermaid node ids allow word characters only
fn node_id(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect()
}
