//! Library surface of modforge, shared by the `modforge` binary and the
//! integration tests.

pub mod artifact;
pub mod build;
pub mod client;
pub mod daemon;
pub mod kernel;
pub mod logging;
pub mod paths;
pub mod pipeline;
pub mod runner;
pub mod vm;
