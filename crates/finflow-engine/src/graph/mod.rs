//! Dependency resolution: compiles a workflow definition into waves.
//!
//! A wave is a set of steps with no dependency relationship among them.
//! Waves are ordered so every dependency of a step lies in a strictly
//! earlier wave; the orchestrator runs one wave at a time and joins it
//! before starting the next.

pub mod plan;
pub mod resolver;

pub use plan::ExecutionPlan;
pub use resolver::compile;
