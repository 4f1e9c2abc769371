//! One full invocation: refresh the working tree, decide what to build,
//! build it, and record the outcomes.

use std::collections::{HashMap, HashSet};

use anyhow::{Context, Result};
use camino::Utf8Path;
use git2::Repository;

use crate::build_log::BuildLog;
use crate::build_package::{BuildContext, run_builds};
use crate::build_plan::{self, BuildPlan};
use crate::builder::Builder;
use crate::changes::{self, ChangeInput, Detected};
use crate::config::Config;
use crate::dep_graph;
use crate::git;
use crate::nvchecker::{NvResults, VersionChecker};
use crate::pacman_repo::PackageDatabase;
use crate::recipe::{self, Recipe};
use crate::report::{Reporter, report_to_maintainers};
use crate::state::Store;
use crate::{CommitHash, Pkgbase};

/// All state of one invocation, threaded through the component calls.
pub struct Cycle<'a> {
    pub config: &'a Config,
    pub store: &'a mut Store,
    pub db: &'a dyn PackageDatabase,
    pub reporter: &'a dyn Reporter,
    /// This invocation's timestamped log directory.
    pub invocation_logdir: &'a Utf8Path,
}

impl Cycle<'_> {
    /// Run one cycle. An empty `pkgs` runs the full detection cycle; a
    /// non-empty list switches to manual-rebuild mode.
    pub async fn run<B: Builder, C: VersionChecker>(
        &mut self,
        builder: &B,
        checker: &mut C,
        pkgs: &[Pkgbase],
    ) -> Result<()> {
        let core = &self.config.buildcycle;
        let repo = git::open(&core.repodir)?;
        git::assert_branch(&repo, &core.branch)?;
        git::reset_hard(&repo)?;
        git::pull_override(&repo, &core.branch)?;

        let (mut recipes, load_errors) = recipe::load_all(&core.repodir)?;
        let mut failed: HashMap<Pkgbase, Option<String>> = HashMap::new();
        for (pkgbase, error) in load_errors {
            tracing::error!("Failed to load recipe for {pkgbase}: {error:#}");
            crate::report::report_admin(
                self.reporter,
                self.config.mail.admin.as_deref(),
                &format!("Failed to load recipe for {pkgbase}"),
                &format!("{error:?}\n"),
            );
            failed.insert(pkgbase, None);
        }

        let manual = !pkgs.is_empty();
        if manual {
            narrow_recipes(&mut recipes, pkgs);
        }
        let depmap = dep_graph::build_dep_map(&recipes, &core.repodir);

        let nv = checker.check(&recipes).await?;

        let head = git::head_commit(&repo)?;
        let detected = if manual {
            manual_detection(pkgs, &nv, &recipes)
        } else {
            self.detect_changes(&repo, &head, &recipes, &nv)?
        };

        let plan = build_plan::plan(&detected.all_building, &recipes, &depmap, self.db)?;
        self.report_nonexistent_deps(&plan, &recipes);
        tracing::info!("Planned {} build(s): {:?}", plan.order.len(), plan.order);

        // In manual mode everything planned was asked for, deps included,
        // so version advancement covers the whole plan.
        let mut need_update = detected.need_update.clone();
        if manual {
            need_update.extend(plan.order.iter().cloned());
        }

        let mut built = HashSet::new();
        let mut log = BuildLog::open(&core.logdir)?;
        let ctx = BuildContext {
            builder_name: &core.name,
            invocation_logdir: self.invocation_logdir,
            repodir: &core.repodir,
            destdir: self.config.destdir(),
            sign_key: self.config.repository.sign_key.as_deref(),
        };
        let loop_result = run_builds(
            &ctx,
            builder,
            &plan.order,
            &plan.depends,
            &recipes,
            &nv.results,
            self.reporter,
            &mut log,
            &mut built,
            &mut failed,
        )
        .await;

        // Outcome recording runs whether or not the loop made it through.
        let finish_result = self.finish(checker, &nv, &need_update, &built, &failed, &repo);
        loop_result?;
        finish_result?;

        // Only a cycle that made it to the end may advance the commit
        // cursor; anything above errors out before this line.
        self.store.last_commit = git::head_commit(&repo)?.to_string();
        Ok(())
    }

    fn detect_changes(
        &self,
        repo: &Repository,
        head: &CommitHash,
        recipes: &HashMap<Pkgbase, Recipe>,
        nv: &NvResults,
    ) -> Result<Detected> {
        let (changed, pkgrel_bumped) = if self.store.last_commit.is_empty() {
            // First run: everything counts as changed, but without an old
            // commit there is no pkgrel verdict.
            (recipes.keys().cloned().collect(), HashSet::new())
        } else {
            let last = CommitHash(self.store.last_commit.clone());
            let changed: HashSet<Pkgbase> = git::changed_pkgbases(repo, &last, head)
                .context("Failed to diff against the last processed commit")?
                .into_iter()
                .filter(|pkgbase| recipes.contains_key(pkgbase))
                .collect();
            let pkgrel_bumped = git::pkgrel_changed(repo, &last, head, &changed)?;
            (changed, pkgrel_bumped)
        };

        Ok(changes::detect(&ChangeInput {
            recipes,
            nv: &nv.results,
            unknown: &nv.unknown,
            rebuild: &nv.rebuild,
            failed: &self.store.failed,
            changed: &changed,
            pkgrel_bumped: &pkgrel_bumped,
        }))
    }

    fn report_nonexistent_deps(&self, plan: &BuildPlan, recipes: &HashMap<Pkgbase, Recipe>) {
        for (pkgbase, deps) in &plan.nonexistent {
            let names: Vec<String> = deps.iter().map(|dep| dep.pkgname.to_string()).collect();
            tracing::error!("{pkgbase} depends on nonexistent packages: {names:?}");
            let Some(recipe) = recipes.get(pkgbase) else {
                continue;
            };
            report_to_maintainers(
                self.reporter,
                recipe,
                &format!("{pkgbase} depends on nonexistent packages"),
                &format!(
                    "The following dependencies of {pkgbase} are neither managed in \
                     this repository nor available from the official repositories:\n  {}\n",
                    names.join("\n  ")
                ),
            );
        }
    }

    /// The guaranteed tail of the cycle: fold this run's outcomes into the
    /// persistent failure record, advance upstream versions for the
    /// packages that were actually handled, and clean the working tree.
    fn finish<C: VersionChecker>(
        &mut self,
        checker: &mut C,
        nv: &NvResults,
        need_update: &HashSet<Pkgbase>,
        built: &HashSet<Pkgbase>,
        failed: &HashMap<Pkgbase, Option<String>>,
        repo: &Repository,
    ) -> Result<()> {
        for pkgbase in failed.keys() {
            match nv.results.get(pkgbase) {
                Some(result) => {
                    self.store
                        .failed
                        .insert(pkgbase.clone(), Some(result.newver.clone()));
                }
                // No verdict this cycle: keep whatever version the record
                // already carries.
                None => {
                    self.store.failed.entry(pkgbase.clone()).or_insert(None);
                }
            }
        }
        for pkgbase in built {
            self.store.failed.remove(pkgbase);
        }

        let mut advance: HashSet<Pkgbase> = if self.config.buildcycle.rebuild_failed_pkgs {
            built.clone()
        } else {
            // Packages that were attempted and are version-driven. This
            // excludes packages that never ran (internal errors) and deps
            // dragged in only transitively.
            let cycle_failed: HashSet<Pkgbase> = failed.keys().cloned().collect();
            let attempted: HashSet<Pkgbase> = built.union(&cycle_failed).cloned().collect();
            let eligible: HashSet<Pkgbase> = need_update.union(&nv.rebuild).cloned().collect();
            attempted.intersection(&eligible).cloned().collect()
        };
        advance.retain(|pkgbase| nv.results.contains_key(pkgbase));
        let take_result = if advance.is_empty() {
            Ok(())
        } else {
            tracing::info!("Advancing upstream versions for {advance:?}");
            checker.take(&advance)
        };

        // The remaining steps are guaranteed: a failed version advance
        // must not leave the working tree dirty or the branch unpushed.
        let reset_result = git::reset_hard(repo);
        let push_result = if self.config.buildcycle.git_push {
            git::push(repo, &self.config.buildcycle.branch)
        } else {
            Ok(())
        };

        let mut outcome = Ok(());
        for (step, result) in [
            ("advance upstream versions", take_result),
            ("reset the working tree", reset_result),
            ("push the working tree", push_result),
        ] {
            if let Err(e) = result {
                tracing::error!("Failed to {step}: {e:#}");
                if outcome.is_ok() {
                    outcome = Err(e.context(format!("Failed to {step}")));
                }
            }
        }
        outcome
    }
}

/// Manual mode bypasses the change detector entirely.
fn manual_detection(
    pkgs: &[Pkgbase],
    nv: &NvResults,
    recipes: &HashMap<Pkgbase, Recipe>,
) -> Detected {
    let mut all_building: HashSet<Pkgbase> = pkgs
        .iter()
        .filter(|pkgbase| {
            let known = recipes.contains_key(*pkgbase);
            if !known {
                tracing::warn!("Ignoring unknown package {pkgbase}");
            }
            known
        })
        .cloned()
        .collect();
    all_building.extend(
        nv.rebuild
            .iter()
            .filter(|pkgbase| recipes.contains_key(*pkgbase))
            .cloned(),
    );
    Detected {
        need_update: all_building.clone(),
        all_building,
        ..Default::default()
    }
}

/// Narrow the working recipe set to the requested packages plus their
/// direct deps, so the checker and planner don't look at the whole tree.
fn narrow_recipes(recipes: &mut HashMap<Pkgbase, Recipe>, pkgs: &[Pkgbase]) {
    let mut keep: HashSet<Pkgbase> = pkgs.iter().cloned().collect();
    for pkgbase in pkgs {
        if let Some(recipe) = recipes.get(pkgbase) {
            keep.extend(recipe.repo_depends.iter().map(|name| Pkgbase::from(name.as_str())));
        }
    }
    recipes.retain(|pkgbase, _| keep.contains(pkgbase));
}
