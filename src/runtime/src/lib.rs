//! Stratum runtime.
//!
//! Builds OCI images from build descriptions with stage-keyed layer
//! caching, stores them locally, and launches them.

#![allow(clippy::result_large_err)]

pub mod cache;
pub mod launch;
pub mod oci;

pub use cache::LayerCache;
pub use launch::{LaunchSpec, Launcher};
pub use oci::build::{ChrootRunner, CommandRunner, LintOptions, Violation};
pub use oci::{BaseImageSource, ImagePuller, ImageReference, ImageStore, StoreSource, StoredImage};
pub use oci::{BuildConfig, BuildResult, Builder, Dockerfile, Instruction, Recipe};
pub use oci::{OciImage, OciImageConfig};

/// Stratum runtime version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default maximum image store size: 10 GB.
pub const DEFAULT_IMAGE_STORE_SIZE: u64 = 10 * 1024 * 1024 * 1024;
