//! Version-range normalization and selection.
//!
//! Registry dependency ranges are mostly well-formed semver, but compound
//! ranges frequently arrive space-separated (`">= 2.1.2 < 3.0.0"`), which the
//! semver parser rejects. Normalization extracts each operator-version token
//! and rejoins them comma-separated before parsing.
//!
//! Hyphen ranges (`1.0.0 - 1.2.0`) and `||` unions are not repaired here;
//! they fall through unchanged.

use regex::Regex;
use semver::{Version, VersionReq};
use std::sync::OnceLock;

/// One comparator token: optional operator plus a full three-part version.
const COMPARATOR_PATTERN: &str = r"(>=|>|<=|<|=|~|\^)?\s*(\d+\.\d+\.\d+)";

fn comparator_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(COMPARATOR_PATTERN).expect("comparator pattern is valid"))
}

/// Rejoin all operator-version tokens with `, ` separators.
///
/// Repairs `">= 2.1.2 < 3.0.0"` into `">=2.1.2, <3.0.0"`. Ranges without any
/// full-version token (`"1.x"`, `"~1.2"`, `"*"`) pass through unchanged.
/// Applying this twice equals applying it once.
#[must_use]
pub fn normalize(range: &str) -> String {
    let mut tokens = Vec::new();

    for caps in comparator_re().captures_iter(range) {
        let op = caps.get(1).map_or("", |m| m.as_str());
        tokens.push(format!("{op}{}", &caps[2]));
    }

    if tokens.is_empty() {
        range.trim().to_string()
    } else {
        tokens.join(", ")
    }
}

/// Parse a requested range into a constraint, normalizing first.
pub fn parse(range: &str) -> Result<VersionReq, semver::Error> {
    VersionReq::parse(&normalize(range))
}

/// Pick the greatest version satisfying `req` from an iterator of parsed
/// versions. Returns `None` when nothing matches.
pub fn max_satisfying<I>(versions: I, req: &VersionReq) -> Option<Version>
where
    I: IntoIterator<Item = Version>,
{
    versions
        .into_iter()
        .filter(|v| req.matches(v))
        .max()
}
