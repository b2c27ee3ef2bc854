use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;

use crate::model::Id;

/// Schema-level node of the mainline model, independent of any business.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelTopologyNode {
    #[serde(rename = "bk_obj_id")]
    pub object_id: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<ModelTopologyNode>,
}

impl ModelTopologyNode {
    pub fn new(object_id: &str) -> Self {
        Self {
            object_id: object_id.to_string(),
            children: Vec::new(),
        }
    }

    pub fn with_child(mut self, child: ModelTopologyNode) -> Self {
        self.children.push(child);
        self
    }

    /// Build a linear chain such as biz -> set -> module.
    pub fn chain(object_ids: &[&str]) -> Option<Self> {
        let (last, rest) = object_ids.split_last()?;
        let mut node = ModelTopologyNode::new(last);
        for object_id in rest.iter().rev() {
            node = ModelTopologyNode::new(object_id).with_child(node);
        }
        Some(node)
    }

    /// Map of child kind to parent kind.
    pub fn parent_map(&self) -> HashMap<String, String> {
        let mut parents = HashMap::new();
        self.collect_parents(&mut parents);
        parents
    }

    fn collect_parents(&self, parents: &mut HashMap<String, String>) {
        for child in &self.children {
            parents.insert(child.object_id.clone(), self.object_id.clone());
            child.collect_parents(parents);
        }
    }

    /// Kinds in breadth-first order, root first.
    pub fn object_ids(&self) -> Vec<String> {
        let mut ordered = Vec::new();
        let mut level = vec![self];
        while !level.is_empty() {
            let mut next = Vec::new();
            for node in level {
                ordered.push(node.object_id.clone());
                next.extend(node.children.iter());
            }
            level = next;
        }
        ordered
    }
}

/// Flat edge row as persisted: a kind and its parent kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelTopologyEdge {
    #[serde(rename = "bk_obj_id")]
    pub object_id: String,
    #[serde(rename = "bk_parent_obj_id")]
    pub parent_object_id: Option<String>,
}

/// Rebuild the model tree from flat edges; `None` without exactly one root.
pub fn model_tree_from_edges(edges: &[ModelTopologyEdge]) -> Option<ModelTopologyNode> {
    let mut roots = edges.iter().filter(|e| e.parent_object_id.is_none());
    let root = roots.next()?;
    if roots.next().is_some() {
        return None;
    }
    Some(attach_children(&root.object_id, edges, 0))
}

fn attach_children(object_id: &str, edges: &[ModelTopologyEdge], depth: usize) -> ModelTopologyNode {
    let mut node = ModelTopologyNode::new(object_id);
    if depth > edges.len() {
        return node;
    }
    for edge in edges
        .iter()
        .filter(|e| e.parent_object_id.as_deref() == Some(object_id))
    {
        node.children
            .push(attach_children(&edge.object_id, edges, depth + 1));
    }
    node
}

/// A concrete business, set, module or custom-level instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MainlineInstance {
    #[serde(rename = "bk_obj_id")]
    pub object_id: String,
    #[serde(rename = "bk_inst_id")]
    pub instance_id: Id,
    #[serde(rename = "bk_inst_name")]
    pub name: String,
    #[serde(rename = "bk_biz_id")]
    pub business_id: Id,
    /// Declared parent instance id; 0 for the business itself.
    #[serde(rename = "bk_parent_id")]
    pub parent_id: Id,
    #[serde(default)]
    pub detail: Map<String, Value>,
}

impl MainlineInstance {
    pub fn new(object_id: &str, instance_id: Id, name: &str, business_id: Id, parent_id: Id) -> Self {
        Self {
            object_id: object_id.to_string(),
            instance_id,
            name: name.to_string(),
            business_id,
            parent_id,
            detail: Map::new(),
        }
    }
}

/// Node of the per-business instance tree; built per query, never stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopoInstanceNode {
    #[serde(rename = "bk_obj_id")]
    pub object_id: String,
    #[serde(rename = "bk_inst_id")]
    pub instance_id: Id,
    #[serde(rename = "bk_inst_name")]
    pub instance_name: String,
    /// Set on nodes synthesized for a model level without instance data.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub placeholder: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<Map<String, Value>>,
    #[serde(default)]
    pub children: Vec<TopoInstanceNode>,
}

impl TopoInstanceNode {
    /// Number of nodes in this subtree, including self.
    pub fn count(&self) -> usize {
        1 + self.children.iter().map(|c| c.count()).sum::<usize>()
    }

    /// Depth-first search for a node by kind and id.
    pub fn find(&self, object_id: &str, instance_id: Id) -> Option<&TopoInstanceNode> {
        if self.object_id == object_id && self.instance_id == instance_id && !self.placeholder {
            return Some(self);
        }
        self.children
            .iter()
            .find_map(|c| c.find(object_id, instance_id))
    }

    /// All nodes of a kind, depth-first.
    pub fn nodes_of_kind<'a>(&'a self, object_id: &str, out: &mut Vec<&'a TopoInstanceNode>) {
        if self.object_id == object_id {
            out.push(self);
        }
        for child in &self.children {
            child.nodes_of_kind(object_id, out);
        }
    }
}
