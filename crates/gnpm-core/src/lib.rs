#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]

//! Core install pipeline for the `gnpm` package installer.
//!
//! Provides:
//! - Parsing package specifiers (`name@range`)
//! - Fetching package metadata from the npm registry
//! - Resolving version ranges using semver
//! - Streaming tarball extraction into `node_modules`
//! - The concurrent resolve/download/extract pipeline

pub mod error;
pub mod graph;
pub mod installer;
pub mod registry;
pub mod semver_range;
pub mod spec;
pub mod tarball;

pub use error::Error;
pub use graph::{package_key, DependencyGraph, PackageNode};
pub use installer::{InstallReport, Installer};
pub use registry::{Packument, RegistryClient, VersionManifest, DEFAULT_REGISTRY};
pub use spec::{PackageSpec, LATEST_TAG};
pub use tarball::ExtractError;
