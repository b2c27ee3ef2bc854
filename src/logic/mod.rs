pub mod attribute_catalog;
pub mod difference;
pub mod force_sync;
pub mod locks;
pub mod remote;
pub mod service_instance;
pub mod template_diff;
pub mod topology;
pub mod topology_tree;

pub use attribute_catalog::*;
pub use difference::*;
pub use force_sync::*;
pub use locks::*;
pub use remote::*;
pub use service_instance::*;
pub use template_diff::*;
pub use topology::*;
pub use topology_tree::*;
