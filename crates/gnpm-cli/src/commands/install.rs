//! `gnpm install` command implementation.

use gnpm_core::{Installer, PackageSpec, RegistryClient, DEFAULT_REGISTRY};
use miette::{IntoDiagnostic, Result};
use std::sync::Arc;
use tracing::info;

/// Install root relative to the working directory.
const INSTALL_ROOT: &str = "node_modules";

/// Resolve and install one package specifier with its transitive
/// dependencies.
///
/// Resolver failures are fatal: the message goes to stdout and the process
/// exits non-zero. Per-package download and extraction failures have already
/// been logged by the pipeline and do not affect the exit status.
pub fn run(specifier: &str) -> Result<()> {
    let spec = PackageSpec::parse(specifier);
    info!(name = %spec.name, requested = %spec.requested, "Installing");

    let runtime = tokio::runtime::Runtime::new().into_diagnostic()?;
    let outcome = runtime.block_on(async {
        let registry = RegistryClient::new(DEFAULT_REGISTRY)?;
        let installer = Arc::new(Installer::new(registry, INSTALL_ROOT));
        installer.run(&spec).await
    });

    match outcome {
        Ok(report) => {
            println!(
                "Installed {} package(s), {} tarball(s) downloaded",
                report.resolved, report.downloaded
            );
            Ok(())
        }
        Err(err) => {
            println!("{err}");
            std::process::exit(1);
        }
    }
}
