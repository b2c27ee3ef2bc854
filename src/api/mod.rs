pub mod business_extractor;
pub mod handlers;
pub mod routes;

pub use business_extractor::*;
pub use handlers::*;
pub use routes::*;
