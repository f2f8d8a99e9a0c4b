//! Multi-agent Text2SQL orchestration.
//!
//! A cooperative pipeline of specialized agents coordinated by a pure
//! router over a shared per-request run. Sub-questions produced by
//! decomposition execute in parallel; disambiguation suspends the run to
//! the state store and resumes on the caller's reply.

pub mod agents;
pub mod orchestrator;
pub mod prompts;
pub mod router;
pub mod run;
pub mod state;
pub mod tools;

pub use agents::{AgentContext, AgentSet, SqlAgent};
pub use orchestrator::Orchestrator;
pub use router::{select_next_agent, NextStep, RouterConfig};
pub use run::{machine_state, InnerRun, MachineState, SubRunOutcome};
pub use tools::ToolRegistry;
