use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{Id, NewProcessInstance};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceTemplate {
    pub id: Id,
    #[serde(rename = "bk_biz_id")]
    pub business_id: Id,
    pub name: String,
    #[serde(rename = "bk_module_id")]
    pub module_id: Id,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceInstance {
    pub id: Id,
    #[serde(rename = "bk_biz_id")]
    pub business_id: Id,
    pub name: String,
    #[serde(rename = "bk_module_id")]
    pub module_id: Id,
    /// 0 when the instance is not bound to a template.
    pub service_template_id: Id,
    #[serde(rename = "bk_host_id")]
    pub host_id: Id,
    pub created_at: DateTime<Utc>,
}

/// Service instance input model for creation (without ID)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewServiceInstance {
    pub name: String,
    #[serde(rename = "bk_module_id")]
    pub module_id: Id,
    #[serde(default)]
    pub service_template_id: Id,
    #[serde(rename = "bk_host_id")]
    pub host_id: Id,
}

impl NewServiceInstance {
    pub fn into_instance(self, id: Id, business_id: Id) -> ServiceInstance {
        ServiceInstance {
            id,
            business_id,
            name: self.name,
            module_id: self.module_id,
            service_template_id: self.service_template_id,
            host_id: self.host_id,
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceInstanceFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub module_id: Option<Id>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_template_id: Option<Id>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_instance_ids: Option<Vec<Id>>,
}

impl ServiceInstanceFilter {
    pub fn matches(&self, instance: &ServiceInstance) -> bool {
        self.module_id.map_or(true, |id| instance.module_id == id)
            && self
                .service_template_id
                .map_or(true, |id| instance.service_template_id == id)
            && self
                .service_instance_ids
                .as_ref()
                .map_or(true, |ids| ids.contains(&instance.id))
    }
}

/// A process to create together with its service instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessCreateDetail {
    #[serde(default)]
    pub process_template_id: Id,
    pub process_info: NewProcessInstance,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceInstanceOnHost {
    #[serde(rename = "bk_host_id")]
    pub host_id: Id,
    #[serde(default)]
    pub processes: Vec<ProcessCreateDetail>,
}

/// Batch creation of service instances sharing one module and template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateServiceInstancesInput {
    pub name: String,
    #[serde(rename = "bk_module_id")]
    pub module_id: Id,
    #[serde(default)]
    pub service_template_id: Id,
    pub instances: Vec<ServiceInstanceOnHost>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instance(id: Id, module_id: Id, template_id: Id) -> ServiceInstance {
        NewServiceInstance {
            name: format!("svc-{}", id),
            module_id,
            service_template_id: template_id,
            host_id: 1,
        }
        .into_instance(id, 3)
    }

    #[test]
    fn test_service_instance_filter() {
        let svc = instance(4, 10, 2);
        assert!(ServiceInstanceFilter::default().matches(&svc));

        let filter = ServiceInstanceFilter {
            module_id: Some(10),
            service_template_id: Some(2),
            service_instance_ids: None,
        };
        assert!(filter.matches(&svc));
        assert!(!filter.matches(&instance(5, 11, 2)));
        assert!(!filter.matches(&instance(6, 10, 0)));

        let by_ids = ServiceInstanceFilter {
            service_instance_ids: Some(vec![1, 2]),
            ..Default::default()
        };
        assert!(!by_ids.matches(&svc));
    }
}
