use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type Id = i64;

/// Object ids of the built-in model kinds.
pub const OBJ_BUSINESS: &str = "biz";
pub const OBJ_SET: &str = "set";
pub const OBJ_MODULE: &str = "module";
pub const OBJ_PROCESS: &str = "process";

/// True for the kinds the mainline loader handles with dedicated steps.
pub fn is_builtin_mainline(object_id: &str) -> bool {
    matches!(object_id, OBJ_BUSINESS | OBJ_SET | OBJ_MODULE)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page {
    #[serde(default)]
    pub start: usize,
    #[serde(default = "default_page_limit")]
    pub limit: usize,
}

fn default_page_limit() -> usize {
    200
}

impl Default for Page {
    fn default() -> Self {
        Self {
            start: 0,
            limit: default_page_limit(),
        }
    }
}

impl Page {
    pub fn unlimited() -> Self {
        Self {
            start: 0,
            limit: usize::MAX,
        }
    }

    /// Apply this page window to an already ordered list.
    pub fn apply<T>(&self, items: Vec<T>) -> Vec<T> {
        items.into_iter().skip(self.start).take(self.limit).collect()
    }
}

pub fn generate_run_id() -> Uuid {
    Uuid::new_v4()
}
