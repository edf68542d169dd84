//! Package specifier parsing.
//!
//! Splits user-supplied specifiers like:
//! - `react`
//! - `react@18.2.0`
//! - `react@^18.0.0`
//! - `@types/node`
//! - `@types/node@^20.0.0`
//!
//! There is no error path: a malformed specifier yields a name the registry
//! will reject downstream.

/// The dist-tag requested when a specifier carries no version or range.
pub const LATEST_TAG: &str = "latest";

/// A parsed package specifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageSpec {
    /// Full package name, `@scope/name` or `name`.
    pub name: String,
    /// Requested version, range, or the `latest` tag.
    pub requested: String,
}

impl PackageSpec {
    /// Split `[@scope/]name[@version-or-range]` into name and requested
    /// version. A missing version defaults to [`LATEST_TAG`]. For scoped
    /// packages the leading `@` belongs to the name, not the version
    /// delimiter.
    #[must_use]
    pub fn parse(input: &str) -> Self {
        let parts: Vec<&str> = input.split('@').collect();

        if input.starts_with('@') {
            // parts[0] is the empty string before the leading '@'.
            match parts.as_slice() {
                [_, name, requested, ..] => Self {
                    name: format!("@{name}"),
                    requested: (*requested).to_string(),
                },
                _ => Self {
                    name: input.to_string(),
                    requested: LATEST_TAG.to_string(),
                },
            }
        } else {
            match parts.as_slice() {
                [name, requested, ..] => Self {
                    name: (*name).to_string(),
                    requested: (*requested).to_string(),
                },
                _ => Self {
                    name: input.to_string(),
                    requested: LATEST_TAG.to_string(),
                },
            }
        }
    }
}
