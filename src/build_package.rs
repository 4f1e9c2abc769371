//! The per-build supervisor: runs the ordered plan one package at a time,
//! captures output, enforces deadlines and turns each typed outcome into
//! reports, events and state updates.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use anyhow::Result;
use camino::Utf8Path;

use crate::build_log::{BuildLog, Event};
use crate::builder::{BuildFailure, BuildRequest, Builder, packager_string};
use crate::dep_graph::Dep;
use crate::nvchecker::NvResult;
use crate::pacman_repo::sign_and_copy;
use crate::recipe::Recipe;
use crate::Pkgbase;
use crate::report::{Reporter, report_to_maintainers};

pub struct BuildContext<'a> {
    /// Builder identity for the `PACKAGER` string.
    pub builder_name: &'a str,
    /// This invocation's log directory; one `<pkgbase>.log` per build.
    pub invocation_logdir: &'a Utf8Path,
    pub repodir: &'a Utf8Path,
    /// Publishing destination; None disables publishing.
    pub destdir: Option<&'a Utf8Path>,
    pub sign_key: Option<&'a str>,
}

/// Walk the plan in order, updating `built` and `failed` in place.
///
/// Failures stay contained to their package. Ctrl-C ends the loop early;
/// the caller's outcome recording still runs.
#[allow(clippy::too_many_arguments)]
pub async fn run_builds<B: Builder>(
    ctx: &BuildContext<'_>,
    builder: &B,
    order: &[Pkgbase],
    depends: &HashMap<Pkgbase, Vec<Dep>>,
    recipes: &HashMap<Pkgbase, Recipe>,
    nv: &HashMap<Pkgbase, NvResult>,
    reporter: &dyn Reporter,
    log: &mut BuildLog,
    built: &mut HashSet<Pkgbase>,
    failed: &mut HashMap<Pkgbase, Option<String>>,
) -> Result<()> {
    for pkgbase in order {
        if failed.contains_key(pkgbase) {
            tracing::info!("Skipping {pkgbase}: already failed this cycle");
            continue;
        }
        let Some(recipe) = recipes.get(pkgbase) else {
            tracing::error!("No recipe for planned package {pkgbase}, skipping");
            continue;
        };
        let no_deps = Vec::new();
        let deps = depends.get(pkgbase).unwrap_or(&no_deps);

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::warn!("Interrupted, leaving the build loop");
                break;
            }
            _ = build_one(
                ctx,
                builder,
                pkgbase,
                recipe,
                nv.get(pkgbase),
                deps,
                reporter,
                log,
                built,
                failed,
            ) => {}
        }
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn build_one<B: Builder>(
    ctx: &BuildContext<'_>,
    builder: &B,
    pkgbase: &Pkgbase,
    recipe: &Recipe,
    update_info: Option<&NvResult>,
    depends: &[Dep],
    reporter: &dyn Reporter,
    log: &mut BuildLog,
    built: &mut HashSet<Pkgbase>,
    failed: &mut HashMap<Pkgbase, Option<String>>,
) {
    let newver = update_info.map(|result| result.newver.as_str());
    let log_path = ctx.invocation_logdir.join(format!("{pkgbase}.log"));
    if let Err(e) = std::fs::File::create(&log_path) {
        tracing::error!("Cannot create build log {log_path}: {e:#}");
        failed.insert(pkgbase.clone(), None);
        return;
    }

    // Children inherit the identity of whoever the build runs on behalf of.
    std::env::set_var(
        "PACKAGER",
        packager_string(ctx.builder_name, &recipe.maintainers[0]),
    );

    tracing::info!("Building {pkgbase} ({})", newver.unwrap_or("no new version"));
    log.record(&Event::BuildStart { pkgbase, newver });
    let started = std::time::Instant::now();

    let time_limit_secs = u64::from(recipe.time_limit_hours) * 3600;
    let request = BuildRequest {
        pkgbase,
        pkgdir: ctx.repodir.join(pkgbase.as_ref()),
        recipe,
        update_info,
        depends,
        log_path: &log_path,
        deadline: tokio::time::Instant::now() + Duration::from_secs(time_limit_secs),
        time_limit_secs,
    };

    let result = builder.build(&request).await;
    let result = match result {
        Ok(output) => match ctx.destdir {
            Some(destdir) => sign_and_copy(&output.artifacts, destdir, ctx.sign_key)
                .await
                .map(|()| output)
                .map_err(|e| BuildFailure::Other(e.context("Failed to publish artifacts"))),
            None => Ok(output),
        },
        Err(failure) => Err(failure),
    };
    let elapsed_secs = started.elapsed().as_secs();

    match result {
        Ok(output) => {
            tracing::info!(
                "Built {pkgbase} {} ({}) in {elapsed_secs}s",
                output.version,
                newver.unwrap_or("-"),
            );
            log.record(&Event::Successful {
                pkgbase,
                newver,
                version: &output.version,
                elapsed_secs,
            });
            built.insert(pkgbase.clone());
        }
        Err(failure) => handle_failure(
            failure,
            pkgbase,
            recipe,
            newver,
            &log_path,
            elapsed_secs,
            reporter,
            log,
            failed,
        ),
    }
    log.record(&Event::BuildEnd {
        pkgbase,
        elapsed_secs,
    });
}

#[allow(clippy::too_many_arguments)]
fn handle_failure(
    failure: BuildFailure,
    pkgbase: &Pkgbase,
    recipe: &Recipe,
    newver: Option<&str>,
    log_path: &Utf8Path,
    elapsed_secs: u64,
    reporter: &dyn Reporter,
    log: &mut BuildLog,
    failed: &mut HashMap<Pkgbase, Option<String>>,
) {
    if let BuildFailure::Skipped(reason) = &failure {
        tracing::warn!("Not building {pkgbase}: {reason}");
        log.record(&Event::Skipped { pkgbase, reason });
        return;
    }

    let reason = failure.to_string();
    tracing::error!("Build of {pkgbase} failed after {elapsed_secs}s: {reason}");
    log.record(&Event::Failed {
        pkgbase,
        newver,
        reason: &reason,
        elapsed_secs,
    });

    let (subject, body) = match &failure {
        BuildFailure::MissingDependencies(missing) => {
            let blocked: Vec<&Pkgbase> = missing
                .iter()
                .filter(|dep| failed.contains_key(*dep))
                .collect();
            let mut body = format!("{pkgbase} cannot be built, missing dependencies:\n");
            for dep in missing {
                body.push_str(&format!("  {dep}\n"));
            }
            if !blocked.is_empty() {
                body.push_str(&format!(
                    "\nAfter building {pkgbase}, it still depends on packages that \
                     failed earlier this cycle: {}\n",
                    blocked
                        .iter()
                        .map(|d| d.to_string())
                        .collect::<Vec<_>>()
                        .join(", ")
                ));
            }
            (format!("{pkgbase} depends on missing packages"), body)
        }
        BuildFailure::ConflictsWithOfficial(names) => (
            format!("{pkgbase} conflicts with official repositories"),
            format!(
                "The following groups or replaced names of {pkgbase} already exist \
                 in the official repositories:\n  {}\n",
                names.join("\n  ")
            ),
        ),
        BuildFailure::Downgrading { built, repo } => (
            format!("{pkgbase} would downgrade the repository"),
            format!(
                "The freshly built {pkgbase} {built} is older than the {repo} \
                 already in the repository.\n"
            ),
        ),
        BuildFailure::TimedOut(limit) => (
            format!("{pkgbase} build timed out"),
            format!(
                "The build exceeded its time limit of {limit} seconds and its \
                 process group was killed.\n\nBuild log: {log_path}\n"
            ),
        ),
        BuildFailure::Skipped(_) => unreachable!("handled above"),
        BuildFailure::Other(e) => (
            format!("Error building {pkgbase}"),
            format!("{e:?}\n\nBuild log: {log_path}\n"),
        ),
    };
    report_to_maintainers(reporter, recipe, &subject, &body);
    failed.insert(pkgbase.clone(), None);
}
