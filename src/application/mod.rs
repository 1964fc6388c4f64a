//! Triggers and workflows on top of the link: idle polling, processing jobs
//! requested by the glasses and backend command relay.

pub mod collaborators;
pub mod orchestrator;

pub use orchestrator::{Collaborators, OrchestratorConfig, TransferOrchestrator};
