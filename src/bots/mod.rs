//! Scanner workers and their supervisor.

pub mod strategy;
pub mod supervisor;
pub mod worker;
