//! The builder backend: runs one package build inside the devtools chroot
//! and reports the outcome as a typed result the supervisor matches on.

use std::fs::OpenOptions;
use std::process::Stdio;
use std::sync::LazyLock;

use anyhow::{Context, anyhow};
use camino::{Utf8Path, Utf8PathBuf};
use nix::sys::signal::{Signal, killpg};
use nix::unistd::{Pid, setsid};
use regex::Regex;
use tokio::process::Command;
use tokio::time::Instant;

use crate::dep_graph::Dep;
use crate::nvchecker::NvResult;
use crate::pacman_repo::{PackageDatabase, artifacts_in};
use crate::pkgbuild::{self, PackageVersion};
use crate::recipe::Recipe;
use crate::{Pkgbase, Maintainer};

/// Why a build did not produce a publishable package. The supervisor picks
/// exactly one handling branch per variant.
#[derive(Debug, thiserror::Error)]
pub enum BuildFailure {
    #[error("missing dependencies: {0:?}")]
    MissingDependencies(Vec<Pkgbase>),
    #[error("conflicts with the official repositories: {0:?}")]
    ConflictsWithOfficial(Vec<String>),
    #[error("built version {built} is older than repo version {repo}")]
    Downgrading { built: String, repo: String },
    #[error("build skipped: {0}")]
    Skipped(String),
    #[error("build timed out after {0} seconds")]
    TimedOut(u64),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[derive(Debug)]
pub struct BuildOutput {
    pub version: PackageVersion,
    pub artifacts: Vec<Utf8PathBuf>,
}

/// Everything one build needs; constructed per package by the supervisor.
pub struct BuildRequest<'a> {
    pub pkgbase: &'a Pkgbase,
    pub pkgdir: Utf8PathBuf,
    pub recipe: &'a Recipe,
    pub update_info: Option<&'a NvResult>,
    pub depends: &'a [Dep],
    pub log_path: &'a Utf8Path,
    /// Wall-clock deadline derived from the recipe's time limit.
    pub deadline: Instant,
    pub time_limit_secs: u64,
}

#[allow(async_fn_in_trait)]
pub trait Builder {
    async fn build(&self, request: &BuildRequest<'_>) -> Result<BuildOutput, BuildFailure>;
}

/// Builds via a devtools-style chroot command (`extra-x86_64-build` by
/// default), with cache directories bind-mounted in and previously built
/// dependency artifacts installed into the chroot.
pub struct ChrootBuilder<D> {
    pub command: Vec<String>,
    pub bindmounts: Vec<String>,
    pub pkg_suffixes: Vec<String>,
    pub db: D,
}

impl<D: PackageDatabase> Builder for ChrootBuilder<D> {
    async fn build(&self, request: &BuildRequest<'_>) -> Result<BuildOutput, BuildFailure> {
        if let Some(reason) = &request.recipe.skip {
            return Err(BuildFailure::Skipped(reason.clone()));
        }
        self.check_official_conflicts(request.recipe)?;

        let status = self.run_build_command(request).await?;
        if !status.success() {
            return Err(self.classify_failure(request, status));
        }

        let version = pkgbuild::package_version_from_dir(&request.pkgdir)
            .context("Build succeeded but the package version is unreadable")?;
        self.check_downgrade(request.pkgbase, &version)?;

        let artifacts = artifacts_in(&request.pkgdir, &self.pkg_suffixes)
            .map_err(BuildFailure::Other)?;
        if artifacts.is_empty() {
            return Err(anyhow!(
                "build command succeeded but produced no artifacts in {}",
                request.pkgdir
            )
            .into());
        }

        Ok(BuildOutput { version, artifacts })
    }
}

impl<D: PackageDatabase> ChrootBuilder<D> {
    /// A managed package must not take over groups or names the official
    /// repositories already serve.
    fn check_official_conflicts(&self, recipe: &Recipe) -> Result<(), BuildFailure> {
        let clashes: Vec<String> = recipe
            .groups
            .iter()
            .chain(recipe.replaces.iter())
            .filter(|name| self.db.provides(name))
            .cloned()
            .collect();
        if clashes.is_empty() {
            Ok(())
        } else {
            Err(BuildFailure::ConflictsWithOfficial(clashes))
        }
    }

    fn check_downgrade(
        &self,
        pkgbase: &Pkgbase,
        version: &PackageVersion,
    ) -> Result<(), BuildFailure> {
        let Some(repo_version) = self.db.repo_version(pkgbase.as_ref()) else {
            return Ok(());
        };
        let built = version.to_alpm().map_err(BuildFailure::Other)?;
        if built < repo_version {
            return Err(BuildFailure::Downgrading {
                built: version.to_string(),
                repo: repo_version.to_string(),
            });
        }
        Ok(())
    }

    async fn run_build_command(
        &self,
        request: &BuildRequest<'_>,
    ) -> Result<std::process::ExitStatus, BuildFailure> {
        let (program, args) = self
            .command
            .split_first()
            .ok_or_else(|| anyhow!("empty build command"))?;

        let mut cmd = Command::new(program);
        cmd.args(args);
        cmd.arg("--");
        for mount in &self.bindmounts {
            cmd.args(["-d", mount]);
        }
        for dep in request.depends {
            let artifacts = artifacts_in(&dep.pkgdir, &self.pkg_suffixes)
                .unwrap_or_default();
            if artifacts.is_empty() {
                tracing::warn!(
                    "No artifacts for dependency {} in {}",
                    dep.pkgname,
                    dep.pkgdir
                );
            }
            for artifact in artifacts {
                cmd.args(["-I", artifact.as_str()]);
            }
        }
        cmd.current_dir(&request.pkgdir);
        // A dropped build (user interrupt) must not leave the chroot
        // command running.
        cmd.kill_on_drop(true);

        let open_log = || {
            OpenOptions::new()
                .append(true)
                .open(request.log_path.as_std_path())
        };
        cmd.stdout(Stdio::from(open_log().context("Failed to open build log")?));
        cmd.stderr(Stdio::from(open_log().context("Failed to open build log")?));
        cmd.stdin(Stdio::null());

        // Run the child as the leader of its own session so the whole
        // descendant group can be reaped on timeout.
        unsafe {
            cmd.pre_exec(|| {
                setsid().map(|_| ()).map_err(std::io::Error::from)
            });
        }

        tracing::info!("Spawning build command: {cmd:?}");
        let mut child = cmd.spawn().context("Failed to spawn build command")?;
        let pid = child.id();

        match tokio::time::timeout_at(request.deadline, child.wait()).await {
            Ok(status) => Ok(status.context("Failed to wait for build command")?),
            Err(_) => {
                tracing::warn!(
                    "Build of {} exceeded {} seconds, killing its process group",
                    request.pkgbase,
                    request.time_limit_secs
                );
                if let Some(pid) = pid {
                    if let Err(e) = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
                        tracing::error!("Failed to kill process group {pid}: {e}");
                    }
                }
                // Reap the leader; the subreaper flag set at startup makes
                // orphaned grandchildren our children, so they don't linger.
                let _ = child.wait().await;
                Err(BuildFailure::TimedOut(request.time_limit_secs))
            }
        }
    }

    fn classify_failure(
        &self,
        request: &BuildRequest<'_>,
        status: std::process::ExitStatus,
    ) -> BuildFailure {
        let tail = read_log_tail(request.log_path);
        let missing = missing_dependencies(&tail);
        if !missing.is_empty() {
            return BuildFailure::MissingDependencies(missing);
        }
        anyhow!("build command exited with {status}, see {}", request.log_path).into()
    }
}

const LOG_TAIL_BYTES: usize = 16 * 1024;

fn read_log_tail(path: &Utf8Path) -> String {
    let content = std::fs::read_to_string(path).unwrap_or_default();
    let start = content.len().saturating_sub(LOG_TAIL_BYTES);
    content[start..].to_string()
}

static TARGET_NOT_FOUND: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"error: target not found: ([A-Za-z0-9@._+-]+)").unwrap());
static UNSATISFIED_DEPENDENCY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"unable to satisfy dependency '([^']+)'").unwrap());

/// Dependency names pacman complained about in the build log.
pub fn missing_dependencies(log: &str) -> Vec<Pkgbase> {
    let mut missing: Vec<Pkgbase> = TARGET_NOT_FOUND
        .captures_iter(log)
        .chain(UNSATISFIED_DEPENDENCY.captures_iter(log))
        .map(|captures| Pkgbase::from(strip_version_constraint(&captures[1])))
        .collect();
    missing.sort();
    missing.dedup();
    missing
}

fn strip_version_constraint(pkgname: &str) -> &str {
    let pkgname = pkgname.split('=').next().unwrap();
    let pkgname = pkgname.split('>').next().unwrap();
    let pkgname = pkgname.split('<').next().unwrap();
    pkgname
}

/// The `PACKAGER` identity recorded in packages built on behalf of a
/// maintainer.
pub fn packager_string(builder_name: &str, maintainer: &Maintainer) -> String {
    format!(
        "{builder_name} (on behalf of {}) <{}>",
        maintainer.name, maintainer.email
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::*;

    #[rstest]
    #[case("pkgname", "pkgname")]
    #[case("pkgname=1.0.0", "pkgname")]
    #[case("pkgname>1.0.0", "pkgname")]
    #[case("pkgname<1.0.0", "pkgname")]
    fn version_constraints_are_stripped(#[case] input: &str, #[case] expected: &str) {
        assert_eq!(strip_version_constraint(input), expected);
    }

    #[test]
    fn pacman_errors_yield_missing_dependency_names() {
        let log = "\
==> Installing packages
error: target not found: libfoo>=2.0
resolving dependencies...
error: failed to prepare transaction (could not satisfy dependencies)
:: installing glibc (2.40-1) breaks dependency 'glibc<2.40' required by old-tool
unable to satisfy dependency 'libbar' required by app
";
        assert_eq!(
            missing_dependencies(log),
            vec![Pkgbase::from("libbar"), Pkgbase::from("libfoo")]
        );
    }

    #[test]
    fn clean_logs_have_no_missing_dependencies() {
        assert!(missing_dependencies("==> Finished making: foo 1.0-1").is_empty());
    }

    struct NoDatabase;

    impl PackageDatabase for NoDatabase {
        fn provides(&self, _name: &str) -> bool {
            false
        }
        fn repo_version(&self, _name: &str) -> Option<alpm_types::Version> {
            None
        }
    }

    #[tokio::test]
    async fn timeout_kills_the_spawned_process_group() {
        let tmp = tempfile::tempdir().unwrap();
        let pkgdir = Utf8Path::from_path(tmp.path()).unwrap().to_path_buf();
        let log_path = pkgdir.join("build.log");
        std::fs::File::create(&log_path).unwrap();
        let pid_file = pkgdir.join("pid");

        let recipe: Recipe = toml::from_str(
            r#"
            [[maintainers]]
            name = "Jane Doe"
            email = "jane@example.org"
            handle = "jane"
            "#,
        )
        .unwrap();
        // The shell records its own pid, then outlives the deadline by far.
        let builder = ChrootBuilder {
            command: vec![
                "sh".to_string(),
                "-c".to_string(),
                format!("echo $$ > {pid_file}; sleep 100"),
            ],
            bindmounts: Vec::new(),
            pkg_suffixes: Vec::new(),
            db: NoDatabase,
        };
        let pkgbase = Pkgbase::from("slow");
        let request = BuildRequest {
            pkgbase: &pkgbase,
            pkgdir: pkgdir.clone(),
            recipe: &recipe,
            update_info: None,
            depends: &[],
            log_path: &log_path,
            deadline: Instant::now() + std::time::Duration::from_secs(1),
            time_limit_secs: 1,
        };

        let started = std::time::Instant::now();
        let result = builder.run_build_command(&request).await;
        // The deadline cuts the build short: nowhere near the 100 seconds
        // the child would sleep.
        assert!(started.elapsed() < std::time::Duration::from_secs(30));
        assert!(matches!(result, Err(BuildFailure::TimedOut(1))));

        // The session leader was killed and reaped, not left behind as a
        // zombie.
        let pid: i32 = std::fs::read_to_string(&pid_file)
            .unwrap()
            .trim()
            .parse()
            .unwrap();
        assert_eq!(
            nix::sys::signal::kill(Pid::from_raw(pid), None),
            Err(nix::errno::Errno::ESRCH)
        );
    }

    #[test]
    fn packager_identity_names_builder_and_maintainer() {
        let maintainer = Maintainer {
            name: "Jane Doe".to_string(),
            email: "jane@example.org".to_string(),
            handle: "jane".to_string(),
        };
        assert_eq!(
            packager_string("buildbot", &maintainer),
            "buildbot (on behalf of Jane Doe) <jane@example.org>"
        );
    }
}
