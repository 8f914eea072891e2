//! Core of the glyphbots evolutionary art engine.
//!
//! A population of organisms, each a short program for a purpose-built stack
//! VM, is evolved against a fitness function that rewards geometric symmetry
//! and visual complexity in the rendered images. The crate provides the full
//! loop: opcode table, VM, analyzer, generator, organism model, environment,
//! and the lifecycle engine. Control planes, file encoding, and config
//! loading live in the application crate.

pub mod analyzer;
pub mod engine;
pub mod environment;
pub mod generator;
pub mod opcode;
pub mod organism;
pub mod vm;

pub use analyzer::{AnalyzerConfig, SymmetryAnalyzer, SymmetryResult};
pub use engine::{
    EngineConfig, EngineStats, Event, EventKind, EvolutionEngine, CHECKPOINT_FILE,
};
pub use environment::{
    Environment, EnvironmentConfig, EnvironmentError, EnvironmentStats, FullConfig, STATE_VERSION,
};
pub use generator::BytecodeGenerator;
pub use opcode::Opcode;
pub use organism::{Organism, OrganismRecord, OrganismStats};
pub use vm::{BytecodeVm, ExecutionStats, Image, VmConfig, VmState};
