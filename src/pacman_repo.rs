//! The official package database and the publishing destination.

use std::io::ErrorKind;
use std::process::Command;
use std::str::FromStr;

use anyhow::{Context, Result, bail};
use camino::{Utf8Path, Utf8PathBuf};

/// Queries against the system package database. Behind a trait so the
/// planner and builder can be exercised without a pacman installation.
pub trait PackageDatabase {
    /// Whether the name exists in the official repositories, either as a
    /// package or as a package group.
    fn provides(&self, name: &str) -> bool;

    /// The version the official repositories currently carry for a package.
    fn repo_version(&self, name: &str) -> Option<alpm_types::Version>;
}

/// Shells out to pacman's sync database.
pub struct Pacman;

impl PackageDatabase for Pacman {
    fn provides(&self, name: &str) -> bool {
        let package = Command::new("pacman")
            .args(["-Sddp", name])
            .output()
            .map(|output| output.status.success())
            .unwrap_or(false);
        if package {
            return true;
        }
        Command::new("pacman")
            .args(["-Sg", name])
            .output()
            .map(|output| output.status.success() && !output.stdout.is_empty())
            .unwrap_or(false)
    }

    fn repo_version(&self, name: &str) -> Option<alpm_types::Version> {
        let output = Command::new("pacman").args(["-Si", name]).output().ok()?;
        if !output.status.success() {
            return None;
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        let raw = stdout.lines().find_map(|line| {
            let (key, value) = line.split_once(':')?;
            (key.trim() == "Version").then(|| value.trim().to_string())
        })?;
        alpm_types::Version::from_str(&raw).ok()
    }
}

/// Artifact files in a build directory matching the configured suffixes,
/// lexicographically sorted. Signature files never match.
pub fn artifacts_in(dir: &Utf8Path, suffixes: &[String]) -> Result<Vec<Utf8PathBuf>> {
    let mut artifacts = Vec::new();
    for entry in dir
        .read_dir_utf8()
        .with_context(|| format!("Failed to list {dir}"))?
    {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let name = entry.file_name();
        if suffixes.iter().any(|suffix| name.ends_with(suffix.as_str())) {
            artifacts.push(entry.path().to_path_buf());
        }
    }
    artifacts.sort();
    Ok(artifacts)
}

/// Detach-sign every artifact and hard-link artifact plus signature into
/// the destination directory. Links that already exist are fine: the same
/// artifact may be re-published after a pkgrel-only rebuild of a sibling.
pub async fn sign_and_copy(
    artifacts: &[Utf8PathBuf],
    destdir: &Utf8Path,
    sign_key: Option<&str>,
) -> Result<()> {
    for artifact in artifacts {
        let signature = sign(artifact, sign_key).await?;
        for file in [artifact, &signature] {
            let file_name = file
                .file_name()
                .with_context(|| format!("artifact path {file} has no file name"))?;
            match std::fs::hard_link(file, destdir.join(file_name)) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {}
                Err(e) => {
                    return Err(e).with_context(|| format!("Failed to link {file} into {destdir}"));
                }
            }
        }
    }
    Ok(())
}

async fn sign(artifact: &Utf8Path, sign_key: Option<&str>) -> Result<Utf8PathBuf> {
    let signature = Utf8PathBuf::from(format!("{artifact}.sig"));
    if signature.exists() {
        return Ok(signature);
    }

    let mut cmd = tokio::process::Command::new("gpg");
    if let Some(key) = sign_key {
        cmd.args(["-u", key]);
    }
    cmd.args(["--detach-sign", "--no-armor", artifact.as_str()]);
    tracing::debug!("Signing {artifact}");
    let status = cmd
        .status()
        .await
        .with_context(|| format!("Failed to run gpg for {artifact}"))?;
    if !status.success() {
        bail!("gpg exited with {status} while signing {artifact}");
    }
    Ok(signature)
}
