pub mod core;
pub mod merge;
pub mod plan;
pub mod schedule;
pub mod setup;
