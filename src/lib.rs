pub mod cli;
pub mod core;
pub mod orchestrator;
pub mod providers;
pub mod storage;
