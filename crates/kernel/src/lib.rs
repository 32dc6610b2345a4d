//! Process wiring and CLI for the agent runtime kernel (SPEC_FULL §0).
//! `main.rs` is a thin shell over this library so integration tests can
//! exercise `bootstrap`/`exec_worker` without shelling out to the binary.

pub mod bootstrap;
pub mod cli;
pub mod exec_worker;
