use serde_json::Value;
use std::collections::HashMap;

use crate::error::CoreResult;
use crate::logic::RemoteCall;
use crate::model::{AttributeDefinition, PropertyType};
use crate::store::traits::AttributeStore;

/// Attribute definitions of one object kind, keyed by property id.
#[derive(Debug, Clone, Default)]
pub struct AttributeCatalog {
    by_property: HashMap<String, AttributeDefinition>,
}

impl AttributeCatalog {
    pub fn new(definitions: Vec<AttributeDefinition>) -> Self {
        Self {
            by_property: definitions
                .into_iter()
                .map(|d| (d.property_id.clone(), d))
                .collect(),
        }
    }

    pub async fn load<S: AttributeStore + ?Sized>(
        store: &S,
        remote: &RemoteCall,
        object_id: &str,
    ) -> CoreResult<Self> {
        let definitions = remote
            .read(
                "read model attributes",
                format!("object {}", object_id),
                store.read_model_attributes(object_id),
            )
            .await?;
        let catalog = Self::new(definitions);
        if catalog.is_empty() {
            log::warn!(
                "no attributes defined for {}, template values will not be compared",
                object_id
            );
        } else {
            log::debug!("loaded {} attributes of {}", catalog.len(), object_id);
        }
        Ok(catalog)
    }

    pub fn get(&self, property_id: &str) -> Option<&AttributeDefinition> {
        self.by_property.get(property_id)
    }

    pub fn len(&self) -> usize {
        self.by_property.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_property.is_empty()
    }

    /// Compare two values under the rule of the property's type.
    ///
    /// Returns `None` for properties the catalog does not know.
    pub fn values_equal(&self, property_id: &str, expected: &Value, actual: &Value) -> Option<bool> {
        self.get(property_id)
            .map(|definition| equal_for_type(definition.property_type, expected, actual))
    }
}

fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        _ => false,
    }
}

fn equal_for_type(property_type: PropertyType, expected: &Value, actual: &Value) -> bool {
    match property_type {
        PropertyType::Int | PropertyType::Float => match (expected.as_f64(), actual.as_f64()) {
            (Some(a), Some(b)) => a == b,
            _ => expected == actual,
        },
        // empty string and null both mean "unset" for text columns
        PropertyType::Singlechar
        | PropertyType::Longchar
        | PropertyType::Enum
        | PropertyType::Time => (is_blank(expected) && is_blank(actual)) || expected == actual,
        PropertyType::Bool | PropertyType::List | PropertyType::Object => expected == actual,
    }
}
