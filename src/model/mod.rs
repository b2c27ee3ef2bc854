pub mod attribute;
pub mod common;
pub mod difference;
pub mod process;
pub mod service;
pub mod topology;

pub use attribute::*;
pub use common::*;
pub use difference::*;
pub use process::*;
pub use service::*;
pub use topology::*;
