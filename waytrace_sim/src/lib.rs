//! Waytrace deterministic trip-simulation harness.
//!
//! Scripts synthetic days out of dwells, travel legs, sleep stretches and
//! recording outages, feeds them through a real [`waytrace_core`] engine,
//! and checks both scenario-specific expectations and the engine's
//! structural invariants. All randomness derives from a single 64-bit
//! seed, so every failure reproduces exactly.

pub mod runner;
pub mod scenarios;
pub mod trips;

pub use runner::{Harness, ScenarioResult, ScenarioRunner};
pub use scenarios::ScenarioId;
pub use trips::{SpeedClassifier, TripOracle};
