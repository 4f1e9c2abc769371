//! Full-cycle scenarios against fake collaborators: a recipe tree in a
//! temporary git repository, a canned version checker, and a builder that
//! returns scripted outcomes.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::sync::Mutex;

use anyhow::Result;
use camino::{Utf8Path, Utf8PathBuf};
use tempfile::TempDir;

use buildcycle::Pkgbase;
use buildcycle::builder::{BuildFailure, BuildOutput, BuildRequest, Builder};
use buildcycle::config::Config;
use buildcycle::cycle::Cycle;
use buildcycle::nvchecker::{NvResult, NvResults, VersionChecker};
use buildcycle::pacman_repo::PackageDatabase;
use buildcycle::pkgbuild::PackageVersion;
use buildcycle::recipe::Recipe;
use buildcycle::report::Reporter;
use buildcycle::state::Store;

struct EmptyDatabase;

impl PackageDatabase for EmptyDatabase {
    fn provides(&self, _name: &str) -> bool {
        false
    }
    fn repo_version(&self, _name: &str) -> Option<alpm_types::Version> {
        None
    }
}

#[derive(Default)]
struct RecordingReporter {
    subjects: Mutex<Vec<String>>,
}

impl Reporter for RecordingReporter {
    fn send(&self, _recipients: &[String], subject: &str, _body: &str) {
        self.subjects.lock().unwrap().push(subject.to_string());
    }
}

#[derive(Default)]
struct FakeChecker {
    results: HashMap<Pkgbase, NvResult>,
    unknown: HashSet<Pkgbase>,
    rebuild: HashSet<Pkgbase>,
    taken: Vec<HashSet<Pkgbase>>,
}

impl FakeChecker {
    fn with(entries: &[(&str, Option<&str>, &str)]) -> Self {
        let results = entries
            .iter()
            .map(|(name, oldver, newver)| {
                (
                    Pkgbase::from(*name),
                    NvResult {
                        oldver: oldver.map(str::to_string),
                        newver: newver.to_string(),
                    },
                )
            })
            .collect();
        FakeChecker {
            results,
            ..Default::default()
        }
    }
}

impl VersionChecker for FakeChecker {
    async fn check(&mut self, recipes: &HashMap<Pkgbase, Recipe>) -> Result<NvResults> {
        let results: HashMap<Pkgbase, NvResult> = self
            .results
            .iter()
            .filter(|(pkgbase, _)| recipes.contains_key(*pkgbase))
            .map(|(pkgbase, result)| (pkgbase.clone(), result.clone()))
            .collect();
        let unknown = recipes
            .keys()
            .filter(|pkgbase| !results.contains_key(*pkgbase))
            .chain(self.unknown.iter())
            .cloned()
            .collect();
        Ok(NvResults {
            results,
            unknown,
            rebuild: self.rebuild.clone(),
        })
    }

    fn take(&mut self, picks: &HashSet<Pkgbase>) -> Result<()> {
        // Durable advance: the next check sees newver as oldver.
        for pkgbase in picks {
            if let Some(result) = self.results.get_mut(pkgbase) {
                result.oldver = Some(result.newver.clone());
            }
        }
        self.taken.push(picks.clone());
        Ok(())
    }
}

#[derive(Clone, Copy)]
enum Outcome {
    Succeed,
    Fail,
    TimeOut,
    Skip,
}

#[derive(Default)]
struct ScriptedBuilder {
    outcomes: HashMap<Pkgbase, Outcome>,
    attempts: Mutex<Vec<Pkgbase>>,
}

impl ScriptedBuilder {
    fn failing(pkgbases: &[&str]) -> Self {
        ScriptedBuilder {
            outcomes: pkgbases
                .iter()
                .map(|name| (Pkgbase::from(*name), Outcome::Fail))
                .collect(),
            ..Default::default()
        }
    }

    fn attempts(&self) -> Vec<Pkgbase> {
        self.attempts.lock().unwrap().clone()
    }
}

impl Builder for ScriptedBuilder {
    async fn build(&self, request: &BuildRequest<'_>) -> Result<BuildOutput, BuildFailure> {
        self.attempts.lock().unwrap().push(request.pkgbase.clone());
        match self.outcomes.get(request.pkgbase).unwrap_or(&Outcome::Succeed) {
            Outcome::Succeed => Ok(BuildOutput {
                version: PackageVersion {
                    epoch: None,
                    pkgver: "1".to_string(),
                    pkgrel: "1".to_string(),
                },
                artifacts: Vec::new(),
            }),
            Outcome::Fail => Err(BuildFailure::Other(anyhow::anyhow!("scripted failure"))),
            Outcome::TimeOut => Err(BuildFailure::TimedOut(request.time_limit_secs)),
            Outcome::Skip => Err(BuildFailure::Skipped("scripted skip".to_string())),
        }
    }
}

struct TestEnv {
    _tmp: TempDir,
    config: Config,
    store: Store,
    repo: git2::Repository,
    invocation_logdir: Utf8PathBuf,
}

impl TestEnv {
    /// A working tree with one directory per package (recipe plus
    /// PKGBUILD), committed on `main`.
    fn new(packages: &[(&str, &[&str])]) -> Self {
        let tmp = TempDir::new().unwrap();
        let root = Utf8Path::from_path(tmp.path()).unwrap();
        let repodir = root.join("repo");
        let logdir = root.join("log");
        let statedir = root.join("state");
        let invocation_logdir = logdir.join("run");
        for dir in [&repodir, &logdir, &statedir, &invocation_logdir] {
            fs::create_dir_all(dir).unwrap();
        }

        let mut opts = git2::RepositoryInitOptions::new();
        opts.initial_head("refs/heads/main");
        let repo = git2::Repository::init_opts(repodir.as_std_path(), &opts).unwrap();

        for (pkgbase, depends) in packages {
            write_package(&repodir, pkgbase, depends, "1");
        }
        commit_all(&repo, "initial packages");

        let config: Config = toml::from_str(&format!(
            r#"
            [buildcycle]
            name = "buildbot"
            repodir = {repodir:?}
            logdir = {logdir:?}
            statedir = {statedir:?}
            "#,
        ))
        .unwrap();

        TestEnv {
            _tmp: tmp,
            config,
            store: Store::default(),
            repo,
            invocation_logdir,
        }
    }

    fn repodir(&self) -> Utf8PathBuf {
        self.config.buildcycle.repodir.clone()
    }

    async fn run(
        &mut self,
        builder: &ScriptedBuilder,
        checker: &mut FakeChecker,
        pkgs: &[Pkgbase],
    ) -> Result<()> {
        let reporter = RecordingReporter::default();
        self.run_with_reporter(builder, checker, pkgs, &reporter).await
    }

    async fn run_with_reporter(
        &mut self,
        builder: &ScriptedBuilder,
        checker: &mut FakeChecker,
        pkgs: &[Pkgbase],
        reporter: &RecordingReporter,
    ) -> Result<()> {
        let mut cycle = Cycle {
            config: &self.config,
            store: &mut self.store,
            db: &EmptyDatabase,
            reporter,
            invocation_logdir: &self.invocation_logdir,
        };
        cycle.run(builder, checker, pkgs).await
    }

    fn head(&self) -> String {
        self.repo
            .head()
            .unwrap()
            .peel_to_commit()
            .unwrap()
            .id()
            .to_string()
    }
}

fn write_package(repodir: &Utf8Path, pkgbase: &str, depends: &[&str], pkgrel: &str) {
    let pkgdir = repodir.join(pkgbase);
    fs::create_dir_all(&pkgdir).unwrap();
    fs::write(
        pkgdir.join("recipe.toml"),
        format!(
            r#"
            repo_depends = [{}]

            [[maintainers]]
            name = "Jane Doe"
            email = "jane@example.org"
            handle = "jane"
            "#,
            depends
                .iter()
                .map(|d| format!("{d:?}"))
                .collect::<Vec<_>>()
                .join(", ")
        ),
    )
    .unwrap();
    fs::write(
        pkgdir.join("PKGBUILD"),
        format!("pkgbase={pkgbase}\npkgver=1\npkgrel={pkgrel}\n"),
    )
    .unwrap();
}

fn commit_all(repo: &git2::Repository, message: &str) {
    let mut index = repo.index().unwrap();
    index
        .add_all(["*"].iter(), git2::IndexAddOption::DEFAULT, None)
        .unwrap();
    index.write().unwrap();
    let tree_id = index.write_tree().unwrap();
    let tree = repo.find_tree(tree_id).unwrap();
    let sig = git2::Signature::now("Test", "test@example.org").unwrap();
    let parents = match repo.head() {
        Ok(head) => vec![head.peel_to_commit().unwrap()],
        Err(_) => vec![],
    };
    let parent_refs: Vec<&git2::Commit> = parents.iter().collect();
    repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &parent_refs)
        .unwrap();
}

fn set(names: &[&str]) -> HashSet<Pkgbase> {
    names.iter().map(|name| Pkgbase::from(*name)).collect()
}

#[tokio::test]
async fn cold_start_builds_only_updated_packages() {
    let mut env = TestEnv::new(&[("a", &[]), ("b", &["a"]), ("c", &[])]);
    let mut checker = FakeChecker::with(&[
        ("a", Some("1"), "2"),
        ("b", Some("5"), "5"),
        ("c", Some("7"), "8"),
    ]);
    let builder = ScriptedBuilder::default();

    env.run(&builder, &mut checker, &[]).await.unwrap();

    assert_eq!(
        builder.attempts(),
        vec![Pkgbase::from("a"), Pkgbase::from("c")]
    );
    assert!(env.store.failed.is_empty());
    assert_eq!(env.store.last_commit, env.head());
    assert_eq!(checker.taken, vec![set(&["a", "c"])]);
}

#[tokio::test]
async fn dependents_are_not_dragged_in_by_dep_updates() {
    let mut env = TestEnv::new(&[("a", &[]), ("b", &["a"])]);
    let mut checker = FakeChecker::with(&[("a", Some("1"), "2"), ("b", Some("5"), "5")]);
    let builder = ScriptedBuilder::default();

    env.run(&builder, &mut checker, &[]).await.unwrap();

    assert_eq!(builder.attempts(), vec![Pkgbase::from("a")]);
}

#[tokio::test]
async fn manual_rebuild_pulls_in_deps_and_advances_both() {
    let mut env = TestEnv::new(&[("a", &[]), ("b", &["a"]), ("c", &[])]);
    let mut checker = FakeChecker::with(&[("a", Some("1"), "1"), ("b", Some("5"), "5")]);
    let builder = ScriptedBuilder::default();

    env.run(&builder, &mut checker, &[Pkgbase::from("b")])
        .await
        .unwrap();

    assert_eq!(
        builder.attempts(),
        vec![Pkgbase::from("a"), Pkgbase::from("b")]
    );
    assert_eq!(checker.taken, vec![set(&["a", "b"])]);
}

#[tokio::test]
async fn failed_package_stays_untouched_until_upstream_moves() {
    let mut env = TestEnv::new(&[("x", &[])]);
    env.store
        .failed
        .insert(Pkgbase::from("x"), Some("3".to_string()));
    env.store.last_commit = env.head();

    let mut checker = FakeChecker::with(&[("x", Some("3"), "3")]);
    let builder = ScriptedBuilder::default();
    env.run(&builder, &mut checker, &[]).await.unwrap();

    assert!(builder.attempts().is_empty());
    assert_eq!(env.store.failed[&Pkgbase::from("x")], Some("3".to_string()));
    assert!(checker.taken.is_empty());
}

#[tokio::test]
async fn failed_package_is_retried_when_upstream_moves() {
    let mut env = TestEnv::new(&[("x", &[])]);
    env.store
        .failed
        .insert(Pkgbase::from("x"), Some("3".to_string()));
    env.store.last_commit = env.head();

    // First attempt at the new version fails again: the recorded version
    // moves along.
    let mut checker = FakeChecker::with(&[("x", Some("3"), "4")]);
    let builder = ScriptedBuilder::failing(&["x"]);
    env.run(&builder, &mut checker, &[]).await.unwrap();
    assert_eq!(builder.attempts(), vec![Pkgbase::from("x")]);
    assert_eq!(env.store.failed[&Pkgbase::from("x")], Some("4".to_string()));
    assert_eq!(checker.taken, vec![set(&["x"])]);

    // A later retry succeeds: the failure record clears.
    let mut checker = FakeChecker::with(&[("x", Some("4"), "5")]);
    let builder = ScriptedBuilder::default();
    env.run(&builder, &mut checker, &[]).await.unwrap();
    assert!(env.store.failed.is_empty());
    assert_eq!(checker.taken, vec![set(&["x"])]);
}

#[tokio::test]
async fn pkgrel_bump_rebuilds_without_advancing_versions() {
    let mut env = TestEnv::new(&[("y", &[])]);
    let mut checker = FakeChecker::with(&[("y", Some("5"), "5")]);

    // Process the initial commit so the next run sees only the bump.
    let builder = ScriptedBuilder::default();
    env.run(&builder, &mut checker, &[]).await.unwrap();
    assert!(builder.attempts().is_empty());

    write_package(&env.repodir(), "y", &[], "2");
    commit_all(&env.repo, "bump pkgrel of y");

    let builder = ScriptedBuilder::default();
    env.run(&builder, &mut checker, &[]).await.unwrap();
    assert_eq!(builder.attempts(), vec![Pkgbase::from("y")]);
    // A pkgrel-only rebuild must not shift the recorded upstream version.
    assert!(checker.taken.is_empty());
    assert_eq!(env.store.last_commit, env.head());
}

#[tokio::test]
async fn timeout_marks_failed_and_the_loop_continues() {
    let mut env = TestEnv::new(&[("slow", &[]), ("quick", &[])]);
    let mut checker =
        FakeChecker::with(&[("slow", Some("1"), "2"), ("quick", Some("1"), "2")]);
    let builder = ScriptedBuilder {
        outcomes: [(Pkgbase::from("slow"), Outcome::TimeOut)].into(),
        ..Default::default()
    };
    let reporter = RecordingReporter::default();

    env.run_with_reporter(&builder, &mut checker, &[], &reporter)
        .await
        .unwrap();

    assert_eq!(
        builder.attempts(),
        vec![Pkgbase::from("quick"), Pkgbase::from("slow")]
    );
    assert_eq!(
        env.store.failed[&Pkgbase::from("slow")],
        Some("2".to_string())
    );
    assert!(!env.store.failed.contains_key(&Pkgbase::from("quick")));
    assert!(
        reporter
            .subjects
            .lock()
            .unwrap()
            .iter()
            .any(|subject| subject.contains("timed out"))
    );
}

#[tokio::test]
async fn skip_signal_neither_fails_nor_advances() {
    let mut env = TestEnv::new(&[("s", &[])]);
    let mut checker = FakeChecker::with(&[("s", Some("1"), "2")]);
    let builder = ScriptedBuilder {
        outcomes: [(Pkgbase::from("s"), Outcome::Skip)].into(),
        ..Default::default()
    };

    env.run(&builder, &mut checker, &[]).await.unwrap();

    assert!(env.store.failed.is_empty());
    assert!(checker.taken.is_empty());
}

#[tokio::test]
async fn a_quiet_second_run_plans_nothing() {
    let mut env = TestEnv::new(&[("a", &[]), ("b", &["a"])]);
    let mut checker = FakeChecker::with(&[("a", Some("1"), "2"), ("b", Some("5"), "5")]);

    let builder = ScriptedBuilder::default();
    env.run(&builder, &mut checker, &[]).await.unwrap();
    assert_eq!(builder.attempts(), vec![Pkgbase::from("a")]);

    // No upstream or recipe changes since: the plan is empty.
    let builder = ScriptedBuilder::default();
    env.run(&builder, &mut checker, &[]).await.unwrap();
    assert!(builder.attempts().is_empty());
}

#[tokio::test]
async fn broken_recipes_are_recorded_but_do_not_stop_the_cycle() {
    let mut env = TestEnv::new(&[("good", &[])]);
    fs::create_dir_all(env.repodir().join("broken")).unwrap();
    fs::write(
        env.repodir().join("broken").join("recipe.toml"),
        "maintainers = 3",
    )
    .unwrap();
    commit_all(&env.repo, "add broken recipe");

    let mut checker = FakeChecker::with(&[("good", Some("1"), "2")]);
    let builder = ScriptedBuilder::default();
    let reporter = RecordingReporter::default();
    env.run_with_reporter(&builder, &mut checker, &[], &reporter)
        .await
        .unwrap();

    // The healthy package still builds; the broken one is never attempted
    // and lands in the failure record without a version.
    assert_eq!(builder.attempts(), vec![Pkgbase::from("good")]);
    assert_eq!(env.store.failed[&Pkgbase::from("broken")], None);
    assert_eq!(env.store.last_commit, env.head());
}
