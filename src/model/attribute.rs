use serde::{Deserialize, Serialize};

/// Storage type of a model attribute; decides how two values are compared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PropertyType {
    Singlechar,
    Longchar,
    Int,
    Float,
    Enum,
    Bool,
    Time,
    List,
    Object,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributeDefinition {
    #[serde(rename = "bk_obj_id")]
    pub object_id: String,
    #[serde(rename = "bk_property_id")]
    pub property_id: String,
    #[serde(rename = "bk_property_name")]
    pub property_name: String,
    #[serde(rename = "bk_property_type")]
    pub property_type: PropertyType,
    #[serde(default = "default_editable")]
    pub editable: bool,
}

fn default_editable() -> bool {
    true
}

impl AttributeDefinition {
    pub fn new(object_id: &str, property_id: &str, property_type: PropertyType) -> Self {
        Self {
            object_id: object_id.to_string(),
            property_id: property_id.to_string(),
            property_name: property_id.to_string(),
            property_type,
            editable: true,
        }
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.property_name = name.to_string();
        self
    }
}
