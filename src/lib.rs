// Purpose: Crate surface for crosspin: impersonated dependency pinning for foreign targets.
// Inputs/Outputs: Re-exports the pipeline pieces for the binary and integration tests.
// Invariants: Resolution is delegated to an external resolver; this crate only shapes what it sees.
// Gotchas: Keep module wiring consistent with src/main.rs.

pub mod cli;
pub mod config;
pub mod env;
pub mod logging;
pub mod pipeline;
pub mod resolver;
pub mod run;
