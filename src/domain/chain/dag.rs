//! DAG view of a chain definition or execution for visualisation

use serde::{Deserialize, Serialize};

use super::definition::{ChainDefinition, ChainStepKind};
use super::execution::{ChainExecution, ChainId, ChainStatus, StepStatus};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DagView {
    pub chain_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chain_id: Option<ChainId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<ChainStatus>,
    pub nodes: Vec<DagNode>,
    pub edges: Vec<DagEdge>,
    pub execution_path: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DagNode {
    pub name: String,
    /// `provider`, `sub_chain` or `parallel`
    pub node_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_chain: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<StepStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub child_chain_id: Option<ChainId>,
    /// Parallel fan-out
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sub_steps: Vec<DagSubStep>,
    /// Expanded sub-chain
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub children: Option<Box<DagView>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DagSubStep {
    pub name: String,
    pub provider: String,
    pub action_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<StepStatus>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DagEdge {
    pub source: String,
    pub target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    pub on_execution_path: bool,
}

impl DagView {
    /// Static view of a definition
    pub fn for_definition(definition: &ChainDefinition) -> Self {
        let nodes = definition
            .steps()
            .iter()
            .map(|step| {
                let mut node = DagNode {
                    name: step.name().to_string(),
                    node_type: step.kind().type_name().to_string(),
                    provider: None,
                    action_type: None,
                    sub_chain: None,
                    status: None,
                    child_chain_id: None,
                    sub_steps: Vec::new(),
                    children: None,
                };

                match step.kind() {
                    ChainStepKind::Provider(provider) => {
                        node.provider = Some(provider.provider.clone());
                        node.action_type = Some(provider.action_type.clone());
                    }
                    ChainStepKind::SubChain(sub) => {
                        node.sub_chain = Some(sub.sub_chain.clone());
                    }
                    ChainStepKind::Parallel(parallel) => {
                        node.sub_steps = parallel
                            .sub_steps
                            .iter()
                            .map(|sub| DagSubStep {
                                name: sub.name.clone(),
                                provider: sub.provider.clone(),
                                action_type: sub.action_type.clone(),
                                status: None,
                            })
                            .collect();
                    }
                }
                node
            })
            .collect();

        Self {
            chain_name: definition.name().to_string(),
            chain_id: None,
            status: None,
            nodes,
            edges: build_edges(definition),
            execution_path: Vec::new(),
        }
    }

    /// View of a definition overlaid with an execution's progress
    pub fn for_execution(definition: &ChainDefinition, execution: &ChainExecution) -> Self {
        let mut view = Self::for_definition(definition);
        view.chain_id = Some(execution.chain_id().clone());
        view.status = Some(execution.status());
        view.execution_path = execution.execution_path().to_vec();

        for node in &mut view.nodes {
            let Some(record) = execution.steps().iter().rev().find(|r| r.name == node.name) else {
                continue;
            };
            node.status = Some(record.status);
            node.child_chain_id = record.child_chain_id.clone();
            for sub in &mut node.sub_steps {
                sub.status = record
                    .sub_steps
                    .iter()
                    .find(|r| r.name == sub.name)
                    .map(|r| r.status);
            }
        }

        let path = &view.execution_path;
        for edge in &mut view.edges {
            edge.on_execution_path = path
                .windows(2)
                .any(|pair| pair[0] == edge.source && pair[1] == edge.target);
        }

        view
    }

    /// Attach an expanded child view to the sub-chain node `step`
    pub fn attach_child(&mut self, step: &str, child: DagView) {
        if let Some(node) = self.nodes.iter_mut().find(|n| n.name == step) {
            node.children = Some(Box::new(child));
        }
    }
}

fn build_edges(definition: &ChainDefinition) -> Vec<DagEdge> {
    let steps = definition.steps();
    let mut edges = Vec::new();

    let edge = |source: &str, target: &str, label: Option<String>| DagEdge {
        source: source.to_string(),
        target: target.to_string(),
        label,
        on_execution_path: false,
    };

    for (index, step) in steps.iter().enumerate() {
        let sequential = steps.get(index + 1).map(|next| next.name());

        match step.kind() {
            ChainStepKind::Provider(provider) => {
                for branch in &provider.branches {
                    edges.push(edge(step.name(), branch.target.as_str(), Some(branch.label())));
                }
                match provider.default_next.as_deref() {
                    Some("") => {}
                    Some(next) => edges.push(edge(step.name(), next, Some("default".to_string()))),
                    None => {
                        if let Some(next) = sequential {
                            edges.push(edge(step.name(), next, None));
                        }
                    }
                }
            }
            ChainStepKind::SubChain(_) | ChainStepKind::Parallel(_) => {
                if let Some(next) = sequential {
                    edges.push(edge(step.name(), next, None));
                }
            }
        }
    }

    edges
}
