use crate::error::{CoreError, CoreResult, TopologyStage};
use crate::logic::RemoteCall;
use crate::model::{
    is_builtin_mainline, Id, MainlineInstance, ModelTopologyNode, OBJ_BUSINESS, OBJ_MODULE,
    OBJ_SET,
};
use crate::store::traits::TopologyStore;

/// Model topology plus every mainline instance of one business, grouped by kind.
#[derive(Debug, Clone)]
pub struct LoadedTopology {
    pub business_id: Id,
    pub model: ModelTopologyNode,
    /// In load order: business, set, module, then custom levels.
    pub levels: Vec<(String, Vec<MainlineInstance>)>,
}

impl LoadedTopology {
    pub fn instances_of(&self, object_id: &str) -> &[MainlineInstance] {
        self.levels
            .iter()
            .find(|(kind, _)| kind == object_id)
            .map(|(_, instances)| instances.as_slice())
            .unwrap_or_default()
    }

    pub fn instance_count(&self) -> usize {
        self.levels.iter().map(|(_, instances)| instances.len()).sum()
    }
}

/// Reads the mainline model and lays a business's instances over it.
pub struct ModelTopologyOverlay<'a, S: ?Sized> {
    store: &'a S,
    remote: RemoteCall,
}

impl<'a, S: TopologyStore + ?Sized> ModelTopologyOverlay<'a, S> {
    pub fn new(store: &'a S, remote: RemoteCall) -> Self {
        Self { store, remote }
    }

    /// The schema tree of mainline kinds, rooted at the business kind.
    pub async fn search_model_topology(&self) -> CoreResult<ModelTopologyNode> {
        let model = self
            .remote
            .read(
                "load model topology",
                "mainline".to_string(),
                self.store.load_model_topology(),
            )
            .await?;
        if model.object_id != OBJ_BUSINESS {
            return Err(CoreError::integrity(format!(
                "mainline model is rooted at {}, expected {}",
                model.object_id, OBJ_BUSINESS
            )));
        }
        Ok(model)
    }

    pub async fn load(&self, business_id: Id) -> CoreResult<LoadedTopology> {
        if business_id <= 0 {
            return Err(CoreError::invalid_input(format!(
                "business id must be positive, got {}",
                business_id
            )));
        }
        let model = self.search_model_topology().await.map_err(|e| {
            log::error!("load mainline model topology failed: {}", e);
            e.at_stage(TopologyStage::ModelTopologyLoad, business_id)
        })?;

        let model_kinds = model.object_ids();
        let mut load_order: Vec<String> = [OBJ_BUSINESS, OBJ_SET, OBJ_MODULE]
            .iter()
            .filter(|kind| model_kinds.iter().any(|k| k.as_str() == **kind))
            .map(|kind| kind.to_string())
            .collect();
        load_order.extend(
            model_kinds
                .iter()
                .filter(|kind| !is_builtin_mainline(kind))
                .cloned(),
        );

        let mut levels = Vec::with_capacity(load_order.len());
        for object_id in load_order {
            let stage = TopologyStage::InstanceLoad {
                object_id: object_id.clone(),
            };
            let mut instances = self
                .remote
                .read(
                    "load mainline instances",
                    format!("business {}, level {}", business_id, object_id),
                    self.store.load_instances_at_level(business_id, &object_id),
                )
                .await
                .map_err(|e| {
                    log::error!(
                        "load {} instances of business {} failed: {}",
                        object_id,
                        business_id,
                        e
                    );
                    e.at_stage(stage.clone(), business_id)
                })?;
            if object_id == OBJ_BUSINESS && instances.is_empty() {
                return Err(CoreError::NotFound {
                    kind: "business",
                    id: business_id,
                }
                .at_stage(stage, business_id));
            }
            instances.sort_by_key(|i| i.instance_id);
            log::debug!(
                "loaded {} {} instances for business {}",
                instances.len(),
                object_id,
                business_id
            );
            levels.push((object_id, instances));
        }

        Ok(LoadedTopology {
            business_id,
            model,
            levels,
        })
    }
}
