//! Multi-backend model access: ranking, quota and RPM governance, retries,
//! and extraction of the structured document from free text.

pub mod extract;
pub mod manager;
pub mod quota;

pub use extract::ExtractError;
pub use manager::{ManagerTuning, ModelError, ModelManager};
