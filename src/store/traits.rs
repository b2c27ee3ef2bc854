use crate::model::{
    AttributeDefinition, Id, MainlineInstance, ModelTopologyNode, NewProcessInstance,
    NewServiceInstance, Page, ProcessInstance, ProcessInstanceRelation, ProcessTemplate,
    RelationFilter, ServiceInstance, ServiceInstanceFilter, ServiceTemplate,
};
use anyhow::Result;

/// Model attribute definitions
#[async_trait::async_trait]
pub trait AttributeStore: Send + Sync {
    async fn read_model_attributes(&self, object_id: &str) -> Result<Vec<AttributeDefinition>>;
}

/// Process templates, process instances and their relations
#[async_trait::async_trait]
pub trait ProcessStore: Send + Sync {
    async fn get_service_template(&self, business_id: Id, id: Id) -> Result<Option<ServiceTemplate>>;
    async fn list_process_templates(
        &self,
        business_id: Id,
        service_template_id: Id,
    ) -> Result<Vec<ProcessTemplate>>;
    async fn list_process_instance_relations(
        &self,
        business_id: Id,
        filter: &RelationFilter,
    ) -> Result<Vec<ProcessInstanceRelation>>;
    async fn get_process_instance(&self, id: Id) -> Result<Option<ProcessInstance>>;
    /// Ids that do not exist are left out of the result
    async fn list_process_instances(&self, ids: &[Id]) -> Result<Vec<ProcessInstance>>;
    async fn create_process_instance(&self, business_id: Id, process: NewProcessInstance) -> Result<Id>;
    /// Replaces the attribute set wholesale
    async fn update_process_instance(&self, id: Id, process: NewProcessInstance) -> Result<()>;
    async fn delete_process_instance(&self, id: Id) -> Result<()>;
    /// Only rows owned by `business_id` are removed
    async fn delete_process_instances(&self, business_id: Id, ids: &[Id]) -> Result<()>;
    async fn create_process_instance_relation(
        &self,
        relation: ProcessInstanceRelation,
    ) -> Result<ProcessInstanceRelation>;
    async fn delete_process_instance_relation(&self, process_id: Id) -> Result<()>;
}

#[async_trait::async_trait]
pub trait ServiceInstanceStore: Send + Sync {
    async fn list_service_instances(
        &self,
        business_id: Id,
        filter: &ServiceInstanceFilter,
        page: Page,
    ) -> Result<Vec<ServiceInstance>>;
    async fn create_service_instance(
        &self,
        business_id: Id,
        instance: NewServiceInstance,
    ) -> Result<ServiceInstance>;
    async fn delete_service_instance(&self, id: Id) -> Result<()>;
}

/// Mainline model and its per-business instances
#[async_trait::async_trait]
pub trait TopologyStore: Send + Sync {
    async fn load_model_topology(&self) -> Result<ModelTopologyNode>;
    async fn load_instances_at_level(
        &self,
        business_id: Id,
        object_id: &str,
    ) -> Result<Vec<MainlineInstance>>;
}

pub trait Store:
    AttributeStore + ProcessStore + ServiceInstanceStore + TopologyStore + Send + Sync
{
}

impl<T> Store for T where
    T: AttributeStore + ProcessStore + ServiceInstanceStore + TopologyStore + Send + Sync
{
}
