use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

use crate::model::Id;

/// One attribute as declared by a process template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateValue {
    /// Declared value; `None` means the template wants the attribute unset.
    pub value: Option<Value>,
    /// Lock flag. `Some(false)` makes the value a creation default only;
    /// instances may diverge from it afterwards.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub as_default_value: Option<bool>,
}

impl TemplateValue {
    pub fn new(value: Value) -> Self {
        Self {
            value: Some(value),
            as_default_value: Some(true),
        }
    }

    pub fn unset() -> Self {
        Self {
            value: None,
            as_default_value: None,
        }
    }

    /// Whether instances must keep carrying the declared value.
    pub fn is_enforced(&self) -> bool {
        self.as_default_value != Some(false)
    }

    /// Value the instance is expected to carry.
    pub fn expected(&self) -> Value {
        self.value.clone().unwrap_or(Value::Null)
    }
}

/// Attribute id to declared value; ordered so diffs come out deterministic.
pub type ProcessProperty = BTreeMap<String, TemplateValue>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessTemplate {
    pub id: Id,
    #[serde(rename = "bk_biz_id")]
    pub business_id: Id,
    pub service_template_id: Id,
    /// `None` marks a template nobody has configured yet.
    pub property: Option<ProcessProperty>,
}

impl ProcessTemplate {
    pub fn is_defined(&self) -> bool {
        self.property.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessInstance {
    #[serde(rename = "bk_process_id")]
    pub id: Id,
    #[serde(rename = "bk_biz_id")]
    pub business_id: Id,
    pub attributes: Map<String, Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ProcessInstance {
    /// Current value of an attribute, `Null` when absent.
    pub fn attribute(&self, property_id: &str) -> &Value {
        self.attributes.get(property_id).unwrap_or(&Value::Null)
    }
}

/// Process instance input model for creation (without ID)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NewProcessInstance {
    #[serde(default)]
    pub attributes: Map<String, Value>,
}

impl NewProcessInstance {
    /// Seed a process with every value the template declares.
    pub fn from_template(property: Option<&ProcessProperty>) -> Self {
        let attributes = property
            .map(|p| {
                p.iter()
                    .map(|(id, v)| (id.clone(), v.expected()))
                    .collect()
            })
            .unwrap_or_default();
        Self { attributes }
    }

    pub fn into_instance(self, id: Id, business_id: Id) -> ProcessInstance {
        let now = Utc::now();
        ProcessInstance {
            id,
            business_id,
            attributes: self.attributes,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Join row: process instance, service instance, process template and host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessInstanceRelation {
    #[serde(rename = "bk_biz_id")]
    pub business_id: Id,
    #[serde(rename = "bk_process_id")]
    pub process_id: Id,
    pub service_instance_id: Id,
    /// 0 when the process is not bound to any template.
    pub process_template_id: Id,
    #[serde(rename = "bk_host_id")]
    pub host_id: Id,
}

impl ProcessInstanceRelation {
    pub fn is_templated(&self) -> bool {
        self.process_template_id != 0
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub process_template_id: Option<Id>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_instance_ids: Option<Vec<Id>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub process_ids: Option<Vec<Id>>,
}

impl RelationFilter {
    pub fn by_service_instances(ids: &[Id]) -> Self {
        Self {
            service_instance_ids: Some(ids.to_vec()),
            ..Default::default()
        }
    }

    pub fn by_processes(ids: &[Id]) -> Self {
        Self {
            process_ids: Some(ids.to_vec()),
            ..Default::default()
        }
    }

    pub fn matches(&self, relation: &ProcessInstanceRelation) -> bool {
        if let Some(template_id) = self.process_template_id {
            if relation.process_template_id != template_id {
                return false;
            }
        }
        if let Some(ids) = &self.service_instance_ids {
            if !ids.contains(&relation.service_instance_id) {
                return false;
            }
        }
        if let Some(ids) = &self.process_ids {
            if !ids.contains(&relation.process_id) {
                return false;
            }
        }
        true
    }
}
