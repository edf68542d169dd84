//! Installer error types.

use crate::tarball::ExtractError;
use reqwest::StatusCode;
use thiserror::Error;

fn version_suffix(version: &Option<String>) -> String {
    version.as_ref().map(|v| format!("@{v}")).unwrap_or_default()
}

/// Errors surfaced by the install pipeline.
///
/// Registry and range errors are fatal at resolve time: the dependency graph
/// is meaningless if metadata is wrong. Tarball and extraction failures are
/// localized to one package and reported without aborting sibling installs.
#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to create HTTP client: {0}")]
    HttpClient(#[source] reqwest::Error),

    #[error("invalid registry URL '{url}': {source}")]
    RegistryUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },

    #[error("registry request for {name}{} failed: {source}", version_suffix(.version))]
    RegistryTransport {
        name: String,
        version: Option<String>,
        #[source]
        source: reqwest::Error,
    },

    #[error("registry returned {status} for {name}{}", version_suffix(.version))]
    RegistryStatus {
        status: StatusCode,
        name: String,
        version: Option<String>,
    },

    #[error("invalid registry JSON for {name}{}: {source}", version_suffix(.version))]
    RegistryDecode {
        name: String,
        version: Option<String>,
        #[source]
        source: serde_json::Error,
    },

    #[error("no version of {name} satisfies range '{range}'")]
    RangeUnsatisfied { name: String, range: String },

    #[error("unable to parse version '{value}' for {name}: {source}")]
    SemverParse {
        name: String,
        value: String,
        #[source]
        source: semver::Error,
    },

    #[error("failed to open tarball {url}: {source}")]
    OpenTarball {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error(transparent)]
    Extract(#[from] ExtractError),
}
