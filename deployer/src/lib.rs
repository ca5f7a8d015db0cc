//! Stackdeploy Library
//!
//! Single-host installer for the copilot service stack: environment checks,
//! installer checkout, model configuration and the privileged installer steps.

pub mod config;
pub mod deploy;
pub mod environment;
pub mod errors;
pub mod filesys;
pub mod logs;
pub mod models;
pub mod privilege;
pub mod storage;
pub mod utils;
