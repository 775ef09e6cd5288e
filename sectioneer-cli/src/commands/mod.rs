//! CLI command implementations.

pub mod run;
pub mod score;
pub mod validate;
