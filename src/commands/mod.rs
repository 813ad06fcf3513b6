//! CLI command implementations.

pub mod run;
pub mod scan;
pub mod start;
pub mod status;
pub mod stop;
