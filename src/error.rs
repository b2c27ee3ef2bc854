//! Error taxonomy of the reconciliation core.
//!
//! Store adapters speak `anyhow`; the logic layer wraps every call with the
//! operation name and the ids involved before anything reaches a caller.

use std::fmt;
use thiserror::Error;
use uuid::Uuid;

use crate::model::Id;

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Stage of the instance topology pipeline that failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopologyStage {
    ModelTopologyLoad,
    InstanceLoad { object_id: String },
    InstanceMapCheck,
    TreeConstruction,
}

impl fmt::Display for TopologyStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ModelTopologyLoad => write!(f, "model topology load"),
            Self::InstanceLoad { object_id } => write!(f, "instance load for level {}", object_id),
            Self::InstanceMapCheck => write!(f, "instance map check"),
            Self::TreeConstruction => write!(f, "tree construction"),
        }
    }
}

#[derive(Debug, Error)]
pub enum CoreError {
    /// Rejected before any remote call was made.
    #[error("invalid input: {message}")]
    InvalidInput { message: String },

    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: Id },

    /// Nothing was mutated; safe to retry.
    #[error("{op} failed ({key}): {source}")]
    RemoteRead {
        op: &'static str,
        key: String,
        #[source]
        source: BoxError,
    },

    /// Earlier writes of the same run are not rolled back.
    #[error("{op} failed ({key}): {source}")]
    RemoteWrite {
        op: &'static str,
        key: String,
        #[source]
        source: BoxError,
    },

    #[error("{op} timed out after {after_ms}ms ({key})")]
    Timeout {
        op: &'static str,
        key: String,
        after_ms: u64,
    },

    #[error("data integrity: {message}")]
    Integrity { message: String },

    #[error("topology of business {business_id} failed at {stage}: {source}")]
    Topology {
        stage: TopologyStage,
        business_id: Id,
        #[source]
        source: Box<CoreError>,
    },

    #[error("force sync run {run_id} is not waiting to be resumed")]
    RunNotFound { run_id: Uuid },

    /// A force sync stopped after `applied` of `total` mutations.
    #[error("force sync run {run_id} interrupted after {applied}/{total} mutations: {source}")]
    SyncInterrupted {
        run_id: Uuid,
        applied: usize,
        total: usize,
        #[source]
        source: Box<CoreError>,
    },
}

impl CoreError {
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    pub fn integrity(message: impl Into<String>) -> Self {
        Self::Integrity {
            message: message.into(),
        }
    }

    pub fn at_stage(self, stage: TopologyStage, business_id: Id) -> Self {
        Self::Topology {
            stage,
            business_id,
            source: Box::new(self),
        }
    }

    /// True when retrying can succeed without operator action.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::RemoteRead { .. }
            | Self::RemoteWrite { .. }
            | Self::Timeout { .. }
            | Self::SyncInterrupted { .. } => true,
            Self::Topology { source, .. } => source.is_retryable(),
            _ => false,
        }
    }
}

pub type CoreResult<T> = Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages_name_operation_and_keys() {
        let err = CoreError::RemoteRead {
            op: "list process templates",
            key: "business 3, service template 7".to_string(),
            source: anyhow::anyhow!("connection reset").into(),
        };
        let message = err.to_string();
        assert!(message.contains("list process templates"));
        assert!(message.contains("service template 7"));
        assert!(message.contains("connection reset"));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_topology_stage_wrapping() {
        let err = CoreError::integrity("module 4 has no parent")
            .at_stage(TopologyStage::InstanceMapCheck, 3);
        assert!(err.to_string().contains("instance map check"));
        assert!(!err.is_retryable());

        let stage = TopologyStage::InstanceLoad {
            object_id: "set".to_string(),
        };
        assert_eq!(stage.to_string(), "instance load for level set");
    }
}
