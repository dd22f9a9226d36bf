//! # Tessera Compiler
//!
//! Turns classified intents into dependency-linked workflows.

pub mod builders;
pub mod compiler;
pub mod engine;

pub use compiler::{CompilerConfig, WorkflowCompiler};
pub use engine::WorkflowEngine;
