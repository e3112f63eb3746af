//! Deterministic, pure logic for the patch pipeline.
//!
//! Nothing in here touches the filesystem, spawns processes or talks to a
//! model backend. Inputs are in-memory values and outputs are reproducible,
//! so every rule the pipeline enforces can be tested in isolation.

pub mod allowlist;
pub mod diff;
pub mod events;
pub mod extract;
pub mod plan;
pub mod report;
pub mod summary;
pub mod types;
