use anyhow::{anyhow, bail, Result};
use chrono::Utc;
use parking_lot::RwLock;
use std::collections::BTreeMap;

use crate::model::{
    AttributeDefinition, Id, MainlineInstance, ModelTopologyNode, NewProcessInstance,
    NewServiceInstance, Page, ProcessInstance, ProcessInstanceRelation, ProcessTemplate,
    RelationFilter, ServiceInstance, ServiceInstanceFilter, ServiceTemplate, OBJ_BUSINESS,
};
use crate::store::traits::{AttributeStore, ProcessStore, ServiceInstanceStore, TopologyStore};

#[derive(Debug, Default)]
struct Inner {
    next_id: Id,
    attributes: Vec<AttributeDefinition>,
    service_templates: BTreeMap<Id, ServiceTemplate>,
    process_templates: BTreeMap<Id, ProcessTemplate>,
    processes: BTreeMap<Id, ProcessInstance>,
    /// Keyed by process id; a process has at most one relation
    relations: BTreeMap<Id, ProcessInstanceRelation>,
    service_instances: BTreeMap<Id, ServiceInstance>,
    model_topology: Option<ModelTopologyNode>,
    mainline: BTreeMap<(String, Id), MainlineInstance>,
    mutations: usize,
}

impl Inner {
    fn allocate_id(&mut self) -> Id {
        self.next_id += 1;
        self.next_id
    }

    /// Keep generated ids clear of ids inserted explicitly.
    fn reserve(&mut self, id: Id) {
        if id > self.next_id {
            self.next_id = id;
        }
    }
}

/// In-process store behind a single lock. Backs the demo server and tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_attribute(&self, attribute: AttributeDefinition) {
        let mut inner = self.inner.write();
        inner
            .attributes
            .retain(|a| !(a.object_id == attribute.object_id && a.property_id == attribute.property_id));
        inner.attributes.push(attribute);
    }

    pub fn insert_service_template(&self, template: ServiceTemplate) {
        let mut inner = self.inner.write();
        inner.reserve(template.id);
        inner.service_templates.insert(template.id, template);
    }

    pub fn insert_process_template(&self, template: ProcessTemplate) {
        let mut inner = self.inner.write();
        inner.reserve(template.id);
        inner.process_templates.insert(template.id, template);
    }

    pub fn remove_process_template(&self, id: Id) -> Option<ProcessTemplate> {
        self.inner.write().process_templates.remove(&id)
    }

    /// Insert a relation row as-is, even if its process does not exist.
    pub fn insert_relation(&self, relation: ProcessInstanceRelation) {
        let mut inner = self.inner.write();
        inner.reserve(relation.process_id);
        inner.relations.insert(relation.process_id, relation);
    }

    pub fn set_model_topology(&self, topology: ModelTopologyNode) {
        self.inner.write().model_topology = Some(topology);
    }

    pub fn insert_mainline_instance(&self, instance: MainlineInstance) {
        self.inner.write().mainline.insert(
            (instance.object_id.clone(), instance.instance_id),
            instance,
        );
    }

    /// Number of writes applied through the store traits.
    pub fn mutation_count(&self) -> usize {
        self.inner.read().mutations
    }

    pub fn relations_of(&self, service_instance_id: Id) -> Vec<ProcessInstanceRelation> {
        self.inner
            .read()
            .relations
            .values()
            .filter(|r| r.service_instance_id == service_instance_id)
            .cloned()
            .collect()
    }

    pub fn process(&self, id: Id) -> Option<ProcessInstance> {
        self.inner.read().processes.get(&id).cloned()
    }
}

#[async_trait::async_trait]
impl AttributeStore for MemoryStore {
    async fn read_model_attributes(&self, object_id: &str) -> Result<Vec<AttributeDefinition>> {
        Ok(self
            .inner
            .read()
            .attributes
            .iter()
            .filter(|a| a.object_id == object_id)
            .cloned()
            .collect())
    }
}

#[async_trait::async_trait]
impl ProcessStore for MemoryStore {
    async fn get_service_template(&self, business_id: Id, id: Id) -> Result<Option<ServiceTemplate>> {
        Ok(self
            .inner
            .read()
            .service_templates
            .get(&id)
            .filter(|t| t.business_id == business_id)
            .cloned())
    }

    async fn list_process_templates(
        &self,
        business_id: Id,
        service_template_id: Id,
    ) -> Result<Vec<ProcessTemplate>> {
        Ok(self
            .inner
            .read()
            .process_templates
            .values()
            .filter(|t| t.business_id == business_id && t.service_template_id == service_template_id)
            .cloned()
            .collect())
    }

    async fn list_process_instance_relations(
        &self,
        business_id: Id,
        filter: &RelationFilter,
    ) -> Result<Vec<ProcessInstanceRelation>> {
        Ok(self
            .inner
            .read()
            .relations
            .values()
            .filter(|r| r.business_id == business_id && filter.matches(r))
            .cloned()
            .collect())
    }

    async fn get_process_instance(&self, id: Id) -> Result<Option<ProcessInstance>> {
        Ok(self.inner.read().processes.get(&id).cloned())
    }

    async fn list_process_instances(&self, ids: &[Id]) -> Result<Vec<ProcessInstance>> {
        let inner = self.inner.read();
        Ok(ids
            .iter()
            .filter_map(|id| inner.processes.get(id).cloned())
            .collect())
    }

    async fn create_process_instance(&self, business_id: Id, process: NewProcessInstance) -> Result<Id> {
        let mut inner = self.inner.write();
        let id = inner.allocate_id();
        inner
            .processes
            .insert(id, process.into_instance(id, business_id));
        inner.mutations += 1;
        Ok(id)
    }

    async fn update_process_instance(&self, id: Id, process: NewProcessInstance) -> Result<()> {
        let mut inner = self.inner.write();
        let existing = inner
            .processes
            .get_mut(&id)
            .ok_or_else(|| anyhow!("process instance {} not found", id))?;
        existing.attributes = process.attributes;
        existing.updated_at = Utc::now();
        inner.mutations += 1;
        Ok(())
    }

    async fn delete_process_instance(&self, id: Id) -> Result<()> {
        let mut inner = self.inner.write();
        if inner.processes.remove(&id).is_some() {
            inner.mutations += 1;
        }
        Ok(())
    }

    async fn delete_process_instances(&self, business_id: Id, ids: &[Id]) -> Result<()> {
        let mut inner = self.inner.write();
        for id in ids {
            let owned = inner
                .processes
                .get(id)
                .map_or(false, |p| p.business_id == business_id);
            if owned {
                inner.processes.remove(id);
                inner.mutations += 1;
            }
        }
        Ok(())
    }

    async fn create_process_instance_relation(
        &self,
        relation: ProcessInstanceRelation,
    ) -> Result<ProcessInstanceRelation> {
        let mut inner = self.inner.write();
        if inner.relations.contains_key(&relation.process_id) {
            bail!("process {} already has a relation", relation.process_id);
        }
        inner.relations.insert(relation.process_id, relation.clone());
        inner.mutations += 1;
        Ok(relation)
    }

    async fn delete_process_instance_relation(&self, process_id: Id) -> Result<()> {
        let mut inner = self.inner.write();
        if inner.relations.remove(&process_id).is_some() {
            inner.mutations += 1;
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl ServiceInstanceStore for MemoryStore {
    async fn list_service_instances(
        &self,
        business_id: Id,
        filter: &ServiceInstanceFilter,
        page: Page,
    ) -> Result<Vec<ServiceInstance>> {
        let matching = self
            .inner
            .read()
            .service_instances
            .values()
            .filter(|s| s.business_id == business_id && filter.matches(s))
            .cloned()
            .collect();
        Ok(page.apply(matching))
    }

    async fn create_service_instance(
        &self,
        business_id: Id,
        instance: NewServiceInstance,
    ) -> Result<ServiceInstance> {
        let mut inner = self.inner.write();
        let id = inner.allocate_id();
        let created = instance.into_instance(id, business_id);
        inner.service_instances.insert(id, created.clone());
        inner.mutations += 1;
        Ok(created)
    }

    async fn delete_service_instance(&self, id: Id) -> Result<()> {
        let mut inner = self.inner.write();
        if inner.service_instances.remove(&id).is_none() {
            bail!("service instance {} not found", id);
        }
        inner.mutations += 1;
        Ok(())
    }
}

#[async_trait::async_trait]
impl TopologyStore for MemoryStore {
    async fn load_model_topology(&self) -> Result<ModelTopologyNode> {
        self.inner
            .read()
            .model_topology
            .clone()
            .ok_or_else(|| anyhow!("mainline model topology is not configured"))
    }

    async fn load_instances_at_level(
        &self,
        business_id: Id,
        object_id: &str,
    ) -> Result<Vec<MainlineInstance>> {
        Ok(self
            .inner
            .read()
            .mainline
            .values()
            .filter(|i| i.object_id == object_id)
            .filter(|i| {
                if object_id == OBJ_BUSINESS {
                    i.instance_id == business_id
                } else {
                    i.business_id == business_id
                }
            })
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_process_lifecycle_counts_mutations() {
        let store = MemoryStore::new();
        let mut process = NewProcessInstance::default();
        process.attributes.insert("port".to_string(), json!(80));

        let id = store.create_process_instance(2, process).await.unwrap();
        assert_eq!(store.process(id).unwrap().attribute("port"), &json!(80));

        store
            .update_process_instance(id, NewProcessInstance::default())
            .await
            .unwrap();
        assert!(store.process(id).unwrap().attributes.is_empty());

        store.delete_process_instance(id).await.unwrap();
        store.delete_process_instance(id).await.unwrap();
        assert!(store.process(id).is_none());
        assert_eq!(store.mutation_count(), 3);

        assert!(store
            .update_process_instance(id, NewProcessInstance::default())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_batch_delete_keeps_other_business_rows() {
        let store = MemoryStore::new();
        let ours = store
            .create_process_instance(2, NewProcessInstance::default())
            .await
            .unwrap();
        let theirs = store
            .create_process_instance(3, NewProcessInstance::default())
            .await
            .unwrap();

        store.delete_process_instances(2, &[ours, theirs]).await.unwrap();
        assert!(store.process(ours).is_none());
        assert!(store.process(theirs).is_some());
    }

    #[tokio::test]
    async fn test_relation_is_unique_per_process() {
        let store = MemoryStore::new();
        let relation = ProcessInstanceRelation {
            business_id: 2,
            process_id: 9,
            service_instance_id: 4,
            process_template_id: 1,
            host_id: 3,
        };
        store
            .create_process_instance_relation(relation.clone())
            .await
            .unwrap();
        assert!(store
            .create_process_instance_relation(relation)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_business_level_loads_only_the_business() {
        let store = MemoryStore::new();
        store.insert_mainline_instance(MainlineInstance::new("biz", 2, "shop", 2, 0));
        store.insert_mainline_instance(MainlineInstance::new("biz", 3, "other", 3, 0));
        store.insert_mainline_instance(MainlineInstance::new("set", 10, "web", 2, 2));

        let biz = store.load_instances_at_level(2, "biz").await.unwrap();
        assert_eq!(biz.len(), 1);
        assert_eq!(biz[0].name, "shop");
        assert_eq!(store.load_instances_at_level(3, "set").await.unwrap().len(), 0);
    }
}
