use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::model::{Id, ProcessInstance};

/// One attribute whose instance value drifted from the template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangedAttribute {
    #[serde(rename = "bk_property_id")]
    pub property_id: String,
    #[serde(rename = "bk_property_name")]
    pub property_name: String,
    /// Value currently carried by the process instance
    pub property_value: Value,
    /// Value declared by the process template
    pub template_property_value: Value,
}

/// Snapshot placed in one of the four classification lists.
///
/// For `Added` entries the process instance is the one that would be created
/// from the template; its id is 0.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessDifferenceDetail {
    pub process_template_id: Id,
    pub process_instance: ProcessInstance,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub changed_attributes: Vec<ChangedAttribute>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DifferenceDetail {
    pub unchanged: Vec<ProcessDifferenceDetail>,
    pub changed: Vec<ProcessDifferenceDetail>,
    pub added: Vec<ProcessDifferenceDetail>,
    pub removed: Vec<ProcessDifferenceDetail>,
}

impl DifferenceDetail {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.unchanged.is_empty()
            && self.changed.is_empty()
            && self.added.is_empty()
            && self.removed.is_empty()
    }

    /// True when applying the template would change nothing.
    pub fn is_in_sync(&self) -> bool {
        self.changed.is_empty() && self.added.is_empty() && self.removed.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceProcessInstanceDifference {
    pub service_instance_id: Id,
    pub service_instance_name: String,
    #[serde(rename = "bk_host_id")]
    pub host_id: Id,
    pub differences: DifferenceDetail,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyKind {
    /// A relation row points at a process instance that cannot be found
    MissingProcessInstance,
    /// A template-bound service instance has no process relations at all
    ServiceInstanceWithoutProcesses,
    /// A requested service instance does not exist
    UnknownServiceInstance,
    /// A requested service instance is bound to another service template
    ForeignServiceInstance,
}

/// Integrity warning reported next to a result instead of failing it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Anomaly {
    pub kind: AnomalyKind,
    pub service_instance_id: Id,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub process_id: Option<Id>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub process_template_id: Option<Id>,
    pub message: String,
}

impl Anomaly {
    pub fn missing_process(relation_service_id: Id, process_id: Id, template_id: Id) -> Self {
        Self {
            kind: AnomalyKind::MissingProcessInstance,
            service_instance_id: relation_service_id,
            process_id: Some(process_id),
            process_template_id: Some(template_id),
            message: format!(
                "relation of service instance {} references process {} which does not exist",
                relation_service_id, process_id
            ),
        }
    }

    pub fn without_processes(service_instance_id: Id) -> Self {
        Self {
            kind: AnomalyKind::ServiceInstanceWithoutProcesses,
            service_instance_id,
            process_id: None,
            process_template_id: None,
            message: format!(
                "service instance {} has no process instance relations",
                service_instance_id
            ),
        }
    }

    pub fn unknown_service_instance(service_instance_id: Id) -> Self {
        Self {
            kind: AnomalyKind::UnknownServiceInstance,
            service_instance_id,
            process_id: None,
            process_template_id: None,
            message: format!("service instance {} not found", service_instance_id),
        }
    }

    pub fn foreign_service_instance(service_instance_id: Id, bound_template_id: Id) -> Self {
        Self {
            kind: AnomalyKind::ForeignServiceInstance,
            service_instance_id,
            process_id: None,
            process_template_id: None,
            message: format!(
                "service instance {} is bound to service template {}",
                service_instance_id, bound_template_id
            ),
        }
    }
}

/// Classification of every service instance plus the integrity side channel.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DifferenceReport {
    pub differences: Vec<ServiceProcessInstanceDifference>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub anomalies: Vec<Anomaly>,
}

impl DifferenceReport {
    pub fn for_service_instance(&self, id: Id) -> Option<&DifferenceDetail> {
        self.differences
            .iter()
            .find(|d| d.service_instance_id == id)
            .map(|d| &d.differences)
    }
}
