//! stratum CLI - build, lint and launch the service image.

pub mod commands;
pub mod output;
