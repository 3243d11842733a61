//! The fixed per-iteration stages. Each stage that talks to a model
//! substitutes a degraded placeholder when every backend fails, so a single
//! stage never aborts the iteration.

pub mod execute;
pub mod memorize;
pub mod plan;
pub mod reflect;
pub mod review;
