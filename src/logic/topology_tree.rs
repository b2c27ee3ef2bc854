//! Assembly of the per-business mainline instance tree.
//!
//! Nodes live in a flat arena while parents are resolved; the nested
//! `TopoInstanceNode` tree is produced in a single pass at the end.

use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::HashMap;

use crate::error::{CoreError, CoreResult, TopologyStage};
use crate::logic::{LoadedTopology, ModelTopologyOverlay, RemoteCall};
use crate::model::{Id, MainlineInstance, TopoInstanceNode};
use crate::store::traits::TopologyStore;

#[derive(Debug, Serialize)]
struct Slot {
    object_id: String,
    instance_id: Id,
    name: String,
    placeholder: bool,
    #[serde(skip)]
    detail: Option<Map<String, Value>>,
    /// Declared parent instance id; unused for placeholders
    declared_parent: Id,
    parent: Option<usize>,
    #[serde(skip)]
    children: Vec<usize>,
}

#[derive(Debug, Default)]
struct InstanceArena {
    slots: Vec<Slot>,
    real: HashMap<(String, Id), usize>,
    /// Keyed by kind and parent slot
    placeholders: HashMap<(String, usize), usize>,
}

impl InstanceArena {
    fn insert_real(&mut self, instance: &MainlineInstance, with_detail: bool) -> CoreResult<usize> {
        let key = (instance.object_id.clone(), instance.instance_id);
        if self.real.contains_key(&key) {
            return Err(CoreError::integrity(format!(
                "{} instance {} is loaded twice",
                instance.object_id, instance.instance_id
            )));
        }
        let slot = self.slots.len();
        self.slots.push(Slot {
            object_id: instance.object_id.clone(),
            instance_id: instance.instance_id,
            name: instance.name.clone(),
            placeholder: false,
            detail: with_detail.then(|| instance.detail.clone()),
            declared_parent: instance.parent_id,
            parent: None,
            children: Vec::new(),
        });
        self.real.insert(key, slot);
        Ok(slot)
    }

    fn placeholder(&mut self, object_id: &str, parent: usize) -> usize {
        if let Some(&slot) = self.placeholders.get(&(object_id.to_string(), parent)) {
            return slot;
        }
        let slot = self.slots.len();
        self.slots.push(Slot {
            object_id: object_id.to_string(),
            instance_id: 0,
            name: String::new(),
            placeholder: true,
            detail: None,
            declared_parent: 0,
            parent: None,
            children: Vec::new(),
        });
        self.placeholders.insert((object_id.to_string(), parent), slot);
        self.link(slot, parent);
        slot
    }

    fn link(&mut self, child: usize, parent: usize) {
        self.slots[child].parent = Some(parent);
        self.slots[parent].children.push(child);
    }

    fn slots_of(&self, object_id: &str) -> Vec<usize> {
        (0..self.slots.len())
            .filter(|&slot| self.slots[slot].object_id == object_id)
            .collect()
    }

    fn real_count(&self, object_id: &str) -> usize {
        self.slots
            .iter()
            .filter(|s| !s.placeholder && s.object_id == object_id)
            .count()
    }

    fn to_node(&self, slot: usize) -> TopoInstanceNode {
        let current = &self.slots[slot];
        let mut children: Vec<TopoInstanceNode> =
            current.children.iter().map(|&c| self.to_node(c)).collect();
        children.sort_by_key(|c| c.instance_id);
        TopoInstanceNode {
            object_id: current.object_id.clone(),
            instance_id: current.instance_id,
            instance_name: current.name.clone(),
            placeholder: current.placeholder,
            detail: current.detail.clone(),
            children,
        }
    }

    fn dump(&self, when: &str) {
        if !log::log_enabled!(log::Level::Debug) {
            return;
        }
        match serde_json::to_string(&self.slots) {
            Ok(dump) => log::debug!("instance map {}: {}", when, dump),
            Err(e) => log::warn!("encode instance map {} failed: {}", when, e),
        }
    }
}

/// Builds the instance tree of one business from a loaded topology.
#[derive(Debug, Clone, Copy, Default)]
pub struct InstanceTopologyTreeBuilder {
    with_detail: bool,
}

impl InstanceTopologyTreeBuilder {
    pub fn new(with_detail: bool) -> Self {
        Self { with_detail }
    }

    pub fn build(&self, loaded: &LoadedTopology) -> CoreResult<TopoInstanceNode> {
        let business_id = loaded.business_id;
        let kinds = loaded.model.object_ids();
        let parents = loaded.model.parent_map();

        let mut arena = InstanceArena::default();
        for kind in &kinds {
            for instance in loaded.instances_of(kind) {
                arena
                    .insert_real(instance, self.with_detail)
                    .map_err(|e| e.at_stage(TopologyStage::InstanceMapCheck, business_id))?;
            }
        }
        arena.dump("before check");

        // Kinds added to the model after their parents were populated have no data yet.
        for kind in kinds.iter().skip(1) {
            let Some(parent_kind) = parents.get(kind) else {
                continue;
            };
            if arena.real_count(kind) > 0 {
                continue;
            }
            for parent in arena.slots_of(parent_kind) {
                arena.placeholder(kind, parent);
            }
        }

        let real: Vec<usize> = (0..arena.slots.len())
            .filter(|&slot| !arena.slots[slot].placeholder)
            .collect();
        let mut root = None;
        for slot in real {
            let kind = arena.slots[slot].object_id.clone();
            let Some(parent_kind) = parents.get(&kind) else {
                root = Some(slot);
                continue;
            };
            let parent = resolve_parent(&mut arena, &parents, slot, parent_kind)
                .map_err(|e| e.at_stage(TopologyStage::InstanceMapCheck, business_id))?;
            arena.link(slot, parent);
        }
        arena.dump("after check");

        let root = root.ok_or_else(|| {
            CoreError::integrity("no business instance to root the tree at")
                .at_stage(TopologyStage::TreeConstruction, business_id)
        })?;
        let tree = arena.to_node(root);
        if tree.count() != arena.slots.len() {
            return Err(CoreError::integrity(format!(
                "tree reaches {} of {} instances",
                tree.count(),
                arena.slots.len()
            ))
            .at_stage(TopologyStage::TreeConstruction, business_id));
        }

        match serde_json::to_string(&tree) {
            Ok(dump) => log::debug!("topo instance tree of business {}: {}", business_id, dump),
            Err(e) => log::warn!("encode topo instance tree of business {} failed: {}", business_id, e),
        }
        Ok(tree)
    }
}

/// Find the slot a real instance hangs under.
///
/// Tries the declared parent under the expected kind first, then under each
/// further ancestor kind, filling the skipped levels with placeholders.
fn resolve_parent(
    arena: &mut InstanceArena,
    parents: &HashMap<String, String>,
    slot: usize,
    parent_kind: &str,
) -> CoreResult<usize> {
    let declared = arena.slots[slot].declared_parent;
    let mut skipped: Vec<&str> = Vec::new();
    let mut candidate = Some(parent_kind);
    while let Some(kind) = candidate {
        if let Some(&ancestor) = arena.real.get(&(kind.to_string(), declared)) {
            let mut parent = ancestor;
            for missing in skipped.iter().rev() {
                parent = arena.placeholder(missing, parent);
            }
            return Ok(parent);
        }
        skipped.push(kind);
        candidate = parents.get(kind).map(String::as_str);
    }
    let orphan = &arena.slots[slot];
    Err(CoreError::integrity(format!(
        "{} instance {} declares parent {} which is not a loaded {} or ancestor",
        orphan.object_id, orphan.instance_id, declared, parent_kind
    )))
}

/// Load and assemble the instance tree of a business.
pub async fn search_mainline_instance_topo<S: TopologyStore + ?Sized>(
    store: &S,
    remote: RemoteCall,
    business_id: Id,
    with_detail: bool,
) -> CoreResult<TopoInstanceNode> {
    let loaded = ModelTopologyOverlay::new(store, remote)
        .load(business_id)
        .await?;
    log::debug!(
        "loaded {} mainline instances across {} levels for business {}",
        loaded.instance_count(),
        loaded.levels.len(),
        business_id
    );
    InstanceTopologyTreeBuilder::new(with_detail)
        .build(&loaded)
        .map_err(|e| {
            log::error!("build topo instance tree of business {} failed: {}", business_id, e);
            e
        })
}
