//! git driver for the recipe working tree.

use std::collections::HashSet;
use std::path::Path;

use anyhow::{Context, Result};
use camino::Utf8Path;
use git2::build::CheckoutBuilder;
use git2::{ErrorCode, FetchOptions, Oid, PushOptions, RemoteCallbacks, Repository, ResetType};
use thiserror::Error;

use crate::pkgbuild::{self, PKGBUILD_FILE};
use crate::{CommitHash, Pkgbase};

/// Raised when the working tree is not on the primary branch; aborts the
/// invocation without a runtime-error report.
#[derive(Debug, Error)]
#[error("working tree is on {actual:?}, expected branch {expected:?}")]
pub struct WrongBranch {
    pub expected: String,
    pub actual: String,
}

pub fn open(repodir: &Utf8Path) -> Result<Repository> {
    Repository::open(repodir.as_std_path())
        .with_context(|| format!("Failed to open git repository at {repodir}"))
}

pub fn assert_branch(repo: &Repository, branch: &str) -> Result<()> {
    let head = repo.head().context("Failed to resolve HEAD")?;
    let actual = head.shorthand().unwrap_or("(detached)").to_string();
    if !head.is_branch() || actual != branch {
        return Err(WrongBranch {
            expected: branch.to_string(),
            actual,
        }
        .into());
    }
    Ok(())
}

pub fn head_commit(repo: &Repository) -> Result<CommitHash> {
    let commit = repo.head()?.peel_to_commit()?;
    Ok(CommitHash(commit.id().to_string()))
}

/// Discard any working tree and index changes left behind by builders.
pub fn reset_hard(repo: &Repository) -> Result<()> {
    let head = repo.head()?.peel(git2::ObjectType::Commit)?;
    let mut checkout = CheckoutBuilder::default();
    checkout.force();
    repo.reset(&head, ResetType::Hard, Some(&mut checkout))
        .context("Failed to hard-reset working tree")
}

fn ssh_agent_callbacks<'a>() -> RemoteCallbacks<'a> {
    let mut callbacks = RemoteCallbacks::new();
    callbacks.credentials(|_, _, _| git2::Cred::ssh_key_from_agent("git"));
    callbacks
}

/// Force-sync the local branch to the remote: fetch, then hard-reset onto
/// `origin/<branch>`. A repository without an `origin` remote is left as
/// it is, so local-only setups keep working.
pub fn pull_override(repo: &Repository, branch: &str) -> Result<()> {
    let mut remote = match repo.find_remote("origin") {
        Ok(remote) => remote,
        Err(e) if e.code() == ErrorCode::NotFound => {
            tracing::warn!("No origin remote, skipping pull");
            return Ok(());
        }
        Err(e) => return Err(e).context("Failed to look up origin remote"),
    };

    let mut fetch_options = FetchOptions::new();
    fetch_options.remote_callbacks(ssh_agent_callbacks());
    remote
        .fetch(&[branch], Some(&mut fetch_options), None)
        .context("Failed to fetch origin")?;

    let oid = repo.refname_to_id(&format!("refs/remotes/origin/{branch}"))?;
    let object = repo.find_object(oid, None)?;
    let mut checkout = CheckoutBuilder::default();
    checkout.force();
    repo.reset(&object, ResetType::Hard, Some(&mut checkout))
        .with_context(|| format!("Failed to reset onto origin/{branch}"))
}

pub fn push(repo: &Repository, branch: &str) -> Result<()> {
    let mut remote = repo.find_remote("origin")?;
    let mut push_options = PushOptions::new();
    push_options.remote_callbacks(ssh_agent_callbacks());
    let refspec = format!("refs/heads/{branch}:refs/heads/{branch}");
    remote
        .push(&[refspec.as_str()], Some(&mut push_options))
        .context("Failed to push")
}

/// Top-level directories touched between two commits. The caller narrows
/// the result to managed packages.
pub fn changed_pkgbases(
    repo: &Repository,
    old: &CommitHash,
    new: &CommitHash,
) -> Result<HashSet<Pkgbase>> {
    let old_tree = repo.find_commit(Oid::from_str(old.as_ref())?)?.tree()?;
    let new_tree = repo.find_commit(Oid::from_str(new.as_ref())?)?.tree()?;
    let diff = repo.diff_tree_to_tree(Some(&old_tree), Some(&new_tree), None)?;

    let mut changed = HashSet::new();
    for delta in diff.deltas() {
        for file in [delta.old_file(), delta.new_file()] {
            let Some(path) = file.path() else { continue };
            if let Some(std::path::Component::Normal(first)) = path.components().next() {
                if let Some(name) = first.to_str() {
                    changed.insert(Pkgbase::from(name));
                }
            }
        }
    }
    Ok(changed)
}

/// Of the given packages, those whose PKGBUILD `pkgrel` differs between
/// the two commits. Packages whose PKGBUILD is missing or non-static on
/// either side produce no verdict.
pub fn pkgrel_changed(
    repo: &Repository,
    old: &CommitHash,
    new: &CommitHash,
    candidates: &HashSet<Pkgbase>,
) -> Result<HashSet<Pkgbase>> {
    let old_tree = repo.find_commit(Oid::from_str(old.as_ref())?)?.tree()?;
    let new_tree = repo.find_commit(Oid::from_str(new.as_ref())?)?.tree()?;

    let mut bumped = HashSet::new();
    for pkgbase in candidates {
        let old_rel = pkgbuild_field_at(repo, &old_tree, pkgbase, "pkgrel");
        let new_rel = pkgbuild_field_at(repo, &new_tree, pkgbase, "pkgrel");
        if let (Some(old_rel), Some(new_rel)) = (old_rel, new_rel) {
            if old_rel != new_rel {
                bumped.insert(pkgbase.clone());
            }
        }
    }
    Ok(bumped)
}

fn pkgbuild_field_at(
    repo: &Repository,
    tree: &git2::Tree<'_>,
    pkgbase: &Pkgbase,
    field: &str,
) -> Option<String> {
    let path = format!("{pkgbase}/{PKGBUILD_FILE}");
    let entry = tree.get_path(Path::new(&path)).ok()?;
    let object = entry.to_object(repo).ok()?;
    let blob = object.as_blob()?;
    let content = std::str::from_utf8(blob.content()).ok()?;
    pkgbuild::field(content, field).map(str::to_string)
}
