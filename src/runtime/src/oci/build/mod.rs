//! Image build support.
//!
//! Parses build descriptions, lints them, and runs them as stage-keyed
//! cached layers on top of a base image.
//!
//! # Supported Instructions
//!
//! FROM, RUN, COPY, WORKDIR, ENV, ENTRYPOINT, CMD, EXPOSE, LABEL, USER, ARG

pub mod context;
pub mod dockerfile;
pub mod engine;
pub mod executor;
pub mod layer;
pub mod lint;
pub mod phase;
pub mod recipe;
pub mod stage;

pub use context::BuildContext;
pub use dockerfile::{Dockerfile, Instruction, Step};
pub use engine::{BuildConfig, BuildResult, Builder, CacheStatus, StepReport};
pub use executor::{ChrootRunner, CommandRunner, RunInvocation};
pub use layer::{DirSnapshot, LayerInfo};
pub use lint::{lint, LintOptions, Severity, Violation};
pub use phase::BuildPhase;
pub use recipe::Recipe;
pub use stage::KeyChain;
