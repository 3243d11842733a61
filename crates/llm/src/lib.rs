//! Generative-text backends for the evoloop control loop.

pub mod http;
pub mod provider;
