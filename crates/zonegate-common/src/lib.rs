pub mod error;
pub mod models;
pub mod zone;

pub use error::Error;
pub use models::*;
