//! npm registry client.
//!
//! Speaks the two JSON endpoint shapes of the public registry
//! (`/{name}` and `/{name}/{version-or-tag}`) and opens tarball streams.
//! Every metadata request asks for the abbreviated install document, which
//! materially reduces response size.

use crate::error::Error;
use reqwest::header::ACCEPT;
use reqwest::{Client, Response};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::Duration;
use url::Url;

/// Default npm registry URL.
pub const DEFAULT_REGISTRY: &str = "https://registry.npmjs.org/";

/// Accept header opting into the registry's abbreviated install metadata.
const INSTALL_ACCEPT: &str =
    "application/vnd.npm.install-v1+json; q=1.0, application/json; q=0.8, */*";

/// Idle keep-alive connections retained per host.
const MAX_IDLE_PER_HOST: usize = 100;

/// How long an idle keep-alive connection is kept around.
const IDLE_TIMEOUT: Duration = Duration::from_secs(90);

/// The `dist` object of a version document.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Dist {
    pub tarball: Option<String>,
}

/// One registry package-version document. Immutable once fetched.
#[derive(Debug, Clone, Deserialize)]
pub struct VersionManifest {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub dist: Dist,
    #[serde(default)]
    pub dependencies: BTreeMap<String, String>,
}

/// The `dist-tags` object of a full package document.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DistTags {
    pub latest: Option<String>,
}

/// The full registry document for a package, fetched only when range
/// resolution needs to enumerate published versions.
#[derive(Debug, Clone, Deserialize)]
pub struct Packument {
    #[serde(rename = "dist-tags", default)]
    pub dist_tags: DistTags,
    #[serde(default)]
    pub versions: BTreeMap<String, VersionManifest>,
}

/// Registry client over a shared keep-alive transport.
#[derive(Debug, Clone)]
pub struct RegistryClient {
    base_url: Url,
    http: Client,
}

impl RegistryClient {
    /// Create a new registry client with the given base URL.
    pub fn new(base_url: &str) -> Result<Self, Error> {
        let base_url = Url::parse(base_url).map_err(|source| Error::RegistryUrl {
            url: base_url.to_string(),
            source,
        })?;

        let http = Client::builder()
            .pool_max_idle_per_host(MAX_IDLE_PER_HOST)
            .pool_idle_timeout(IDLE_TIMEOUT)
            .user_agent(concat!("gnpm/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(Error::HttpClient)?;

        Ok(Self { base_url, http })
    }

    /// Get the base URL.
    #[must_use]
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Fetch a single version document from `/{name}/{version-or-tag}`.
    ///
    /// `version_or_tag` is either a full version or a dist-tag like `latest`.
    /// Scoped names (`@scope/name`) pass through the path unchanged.
    pub async fn fetch_version(
        &self,
        name: &str,
        version_or_tag: &str,
    ) -> Result<VersionManifest, Error> {
        let body = self
            .get_metadata(&format!("{name}/{version_or_tag}"), name, Some(version_or_tag))
            .await?;

        serde_json::from_slice(&body).map_err(|source| Error::RegistryDecode {
            name: name.to_string(),
            version: Some(version_or_tag.to_string()),
            source,
        })
    }

    /// Fetch the full package document from `/{name}`.
    pub async fn fetch_packument(&self, name: &str) -> Result<Packument, Error> {
        let body = self.get_metadata(name, name, None).await?;

        serde_json::from_slice(&body).map_err(|source| Error::RegistryDecode {
            name: name.to_string(),
            version: None,
            source,
        })
    }

    /// Open a tarball download as a streaming response.
    ///
    /// The caller owns the stream and is responsible for consuming or
    /// dropping it.
    pub async fn open_tarball(&self, url: &str) -> Result<Response, Error> {
        let into_error = |source| Error::OpenTarball {
            url: url.to_string(),
            source,
        };

        let response = self.http.get(url).send().await.map_err(into_error)?;
        response.error_for_status().map_err(into_error)
    }

    async fn get_metadata(
        &self,
        path: &str,
        name: &str,
        version: Option<&str>,
    ) -> Result<bytes::Bytes, Error> {
        let transport = |source| Error::RegistryTransport {
            name: name.to_string(),
            version: version.map(ToString::to_string),
            source,
        };

        let url = self.base_url.join(path).map_err(|source| Error::RegistryUrl {
            url: format!("{}{path}", self.base_url),
            source,
        })?;

        let response = self
            .http
            .get(url)
            .header(ACCEPT, INSTALL_ACCEPT)
            .send()
            .await
            .map_err(transport)?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::RegistryStatus {
                status,
                name: name.to_string(),
                version: version.map(ToString::to_string),
            });
        }

        response.bytes().await.map_err(transport)
    }
}
