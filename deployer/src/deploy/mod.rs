//! Deployment module

pub mod cancel;
pub mod cluster;
pub mod fsm;
pub mod git;
pub mod hosts;
pub mod orchestrator;
pub mod status;
pub mod steps;
