use std::collections::HashMap;
use std::fs;

use anyhow::{Context, Result, bail};
use camino::{Utf8Path, Utf8PathBuf};
use directories::ProjectDirs;
use serde::Deserialize;

pub const CONFIG_FILE: &str = "config.toml";

#[derive(Deserialize, Debug, Clone)]
pub struct Config {
    pub buildcycle: Core,
    #[serde(default)]
    pub repository: Repository,
    #[serde(default)]
    pub nvchecker: Nvchecker,
    #[serde(default)]
    pub mail: Mail,
    /// Exported into the process environment verbatim at startup.
    #[serde(default)]
    pub env: HashMap<String, String>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct Core {
    /// Builder identity used in the `PACKAGER` string.
    pub name: String,
    /// Working tree holding one directory per managed package.
    pub repodir: Utf8PathBuf,
    /// Root of the log tree; one subdirectory per invocation.
    pub logdir: Utf8PathBuf,
    /// Holds the persistent store, its lock and the version checker files.
    pub statedir: Utf8PathBuf,
    #[serde(default = "default_branch")]
    pub branch: String,
    /// Advance upstream versions for successfully built packages only.
    #[serde(default)]
    pub rebuild_failed_pkgs: bool,
    #[serde(default)]
    pub git_push: bool,
    /// Sandbox build command; the package directory is appended.
    #[serde(default = "default_build_command")]
    pub build_command: Vec<String>,
    /// `src:dest` pairs handed to the build command. Source directories are
    /// created before the first build and shared read-write across builds.
    #[serde(default)]
    pub bindmounts: Vec<String>,
    /// Artifact file suffixes considered for publishing and dep installs.
    #[serde(default = "default_pkg_suffixes")]
    pub pkg_suffixes: Vec<String>,
}

#[derive(Deserialize, Debug, Clone, Default)]
pub struct Repository {
    /// Publishing destination; empty or absent disables publishing.
    pub destdir: Option<Utf8PathBuf>,
    /// GPG key id used for detached artifact signatures.
    pub sign_key: Option<String>,
}

#[derive(Deserialize, Debug, Clone, Default)]
pub struct Nvchecker {
    /// HTTP proxy exported to the checker process.
    pub proxy: Option<String>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct Mail {
    /// A sendmail-compatible command reading the message from stdin.
    #[serde(default = "default_mail_command")]
    pub command: Vec<String>,
    #[serde(default = "default_mail_from")]
    pub from: String,
    /// Recipient for reports that have no maintainer to go to.
    pub admin: Option<String>,
}

impl Default for Mail {
    fn default() -> Self {
        Mail {
            command: default_mail_command(),
            from: default_mail_from(),
            admin: None,
        }
    }
}

fn default_branch() -> String {
    "main".to_string()
}

fn default_build_command() -> Vec<String> {
    vec!["extra-x86_64-build".to_string()]
}

fn default_pkg_suffixes() -> Vec<String> {
    vec![".pkg.tar.zst".to_string(), ".pkg.tar.xz".to_string()]
}

fn default_mail_command() -> Vec<String> {
    vec!["sendmail".to_string(), "-t".to_string()]
}

fn default_mail_from() -> String {
    "buildcycle <buildcycle@localhost>".to_string()
}

impl Config {
    /// Load the configuration from the explicitly given path, or from the
    /// first existing candidate among the user's XDG config directory and
    /// `/etc/buildcycle/`.
    pub fn load(explicit: Option<&Utf8Path>) -> Result<(Config, Utf8PathBuf)> {
        let path = match explicit {
            Some(path) => path.to_path_buf(),
            None => search_config_file()?,
        };
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file {path}"))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {path}"))?;
        config.validate()?;
        Ok((config, path))
    }

    fn validate(&self) -> Result<()> {
        if self.buildcycle.name.is_empty() {
            bail!("buildcycle.name must not be empty");
        }
        if self.buildcycle.build_command.is_empty() {
            bail!("buildcycle.build_command must not be empty");
        }
        for mount in &self.buildcycle.bindmounts {
            if !mount.contains(':') {
                bail!("bindmount {mount:?} is not of the form src:dest");
            }
        }
        Ok(())
    }

    /// The publishing destination, unless publishing is disabled.
    pub fn destdir(&self) -> Option<&Utf8Path> {
        self.repository
            .destdir
            .as_deref()
            .filter(|path| !path.as_str().is_empty())
    }
}

fn search_config_file() -> Result<Utf8PathBuf> {
    let mut candidates = Vec::new();
    if let Some(project_dirs) = ProjectDirs::from("org", "buildcycle", "buildcycle") {
        if let Ok(dir) = Utf8PathBuf::from_path_buf(project_dirs.config_dir().to_path_buf()) {
            candidates.push(dir.join(CONFIG_FILE));
        }
    }
    candidates.push(Utf8PathBuf::from("/etc/buildcycle").join(CONFIG_FILE));

    for candidate in &candidates {
        if candidate.exists() {
            return Ok(candidate.clone());
        }
    }
    bail!("No config file found, looked at: {candidates:?}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_minimal_config() {
        let config: Config = toml::from_str(
            r#"
            [buildcycle]
            name = "buildbot"
            repodir = "/srv/repo"
            logdir = "/var/log/buildcycle"
            statedir = "/var/lib/buildcycle"
            "#,
        )
        .unwrap();
        assert_eq!(config.buildcycle.branch, "main");
        assert_eq!(config.buildcycle.build_command, ["extra-x86_64-build"]);
        assert!(!config.buildcycle.rebuild_failed_pkgs);
        assert!(config.destdir().is_none());
        assert_eq!(config.mail.command, ["sendmail", "-t"]);
    }

    #[test]
    fn empty_destdir_disables_publishing() {
        let config: Config = toml::from_str(
            r#"
            [buildcycle]
            name = "buildbot"
            repodir = "/srv/repo"
            logdir = "/var/log/buildcycle"
            statedir = "/var/lib/buildcycle"

            [repository]
            destdir = ""
            "#,
        )
        .unwrap();
        assert!(config.destdir().is_none());
    }

    #[test]
    fn env_section_passes_through() {
        let config: Config = toml::from_str(
            r#"
            [buildcycle]
            name = "buildbot"
            repodir = "/srv/repo"
            logdir = "/var/log/buildcycle"
            statedir = "/var/lib/buildcycle"

            [env]
            TZ = "UTC"
            "#,
        )
        .unwrap();
        assert_eq!(config.env["TZ"], "UTC");
    }
}
