use std::fmt;
use std::fs;
use std::str::FromStr;

use anyhow::{Context, Result, anyhow};
use camino::Utf8Path;
use serde::Serialize;

pub const PKGBUILD_FILE: &str = "PKGBUILD";

/// The composed version of one build instance of a package.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct PackageVersion {
    pub epoch: Option<u64>,
    pub pkgver: String,
    pub pkgrel: String,
}

impl fmt::Display for PackageVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(epoch) = self.epoch {
            write!(f, "{epoch}:")?;
        }
        write!(f, "{}-{}", self.pkgver, self.pkgrel)
    }
}

impl PackageVersion {
    /// Parse into an [`alpm_types::Version`] for vercmp-ordered comparison.
    pub fn to_alpm(&self) -> Result<alpm_types::Version> {
        alpm_types::Version::from_str(&self.to_string())
            .map_err(|e| anyhow!("invalid package version {self}: {e}"))
    }
}

/// Extract a `name=value` assignment from PKGBUILD text.
///
/// This intentionally only understands the static single-line form used
/// for pkgver/pkgrel/epoch; anything computed in shell is out of reach and
/// returns None.
pub fn field<'a>(content: &'a str, name: &str) -> Option<&'a str> {
    content.lines().find_map(|line| {
        let rest = line.trim_start().strip_prefix(name)?;
        let value = rest.strip_prefix('=')?;
        Some(value.trim().trim_matches('\'').trim_matches('"'))
    })
}

pub fn package_version(content: &str) -> Result<PackageVersion> {
    let pkgver = field(content, "pkgver")
        .ok_or_else(|| anyhow!("PKGBUILD has no static pkgver"))?;
    let pkgrel = field(content, "pkgrel")
        .ok_or_else(|| anyhow!("PKGBUILD has no static pkgrel"))?;
    let epoch = match field(content, "epoch") {
        Some(raw) => Some(raw.parse().context("invalid epoch")?),
        None => None,
    };
    Ok(PackageVersion {
        epoch,
        pkgver: pkgver.to_string(),
        pkgrel: pkgrel.to_string(),
    })
}

pub fn package_version_from_dir(pkgdir: &Utf8Path) -> Result<PackageVersion> {
    let path = pkgdir.join(PKGBUILD_FILE);
    let content =
        fs::read_to_string(&path).with_context(|| format!("Failed to read {path}"))?;
    package_version(&content)
}
