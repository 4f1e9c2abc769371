use std::collections::HashMap;
use std::fs;

use anyhow::{Context, Result, bail};
use camino::Utf8Path;
use serde::Deserialize;

use crate::{Maintainer, Pkgbase};

pub const RECIPE_FILE: &str = "recipe.toml";

/// Per-package metadata describing how to build it and who maintains it.
#[derive(Deserialize, Debug, Clone)]
pub struct Recipe {
    pub maintainers: Vec<Maintainer>,
    #[serde(default = "default_time_limit")]
    pub time_limit_hours: u32,
    /// Other managed packages that must be built and installed first.
    #[serde(default)]
    pub repo_depends: Vec<String>,
    /// Package groups this recipe's packages join.
    #[serde(default)]
    pub groups: Vec<String>,
    /// Packages this recipe's packages replace.
    #[serde(default)]
    pub replaces: Vec<String>,
    /// When set, the builder refuses the build and reports this reason.
    #[serde(default)]
    pub skip: Option<String>,
    /// Upstream version source, copied verbatim into the checker config.
    #[serde(default)]
    pub update: Option<toml::Table>,
}

fn default_time_limit() -> u32 {
    1
}

impl Recipe {
    fn validate(&self) -> Result<()> {
        if self.maintainers.is_empty() {
            bail!("recipe has no maintainers");
        }
        if self.time_limit_hours == 0 {
            bail!("time_limit_hours must be positive");
        }
        Ok(())
    }
}

pub fn load(pkgdir: &Utf8Path) -> Result<Recipe> {
    let path = pkgdir.join(RECIPE_FILE);
    let content =
        fs::read_to_string(&path).with_context(|| format!("Failed to read {path}"))?;
    let recipe: Recipe =
        toml::from_str(&content).with_context(|| format!("Failed to parse {path}"))?;
    recipe.validate()?;
    Ok(recipe)
}

/// Load every recipe under the working tree. A directory is a managed
/// package iff it contains a recipe file. Load failures don't abort the
/// cycle; they are returned per package so the caller can record and
/// report them while the rest proceeds.
pub fn load_all(
    repodir: &Utf8Path,
) -> Result<(HashMap<Pkgbase, Recipe>, Vec<(Pkgbase, anyhow::Error)>)> {
    let mut recipes = HashMap::new();
    let mut errors = Vec::new();

    for entry in repodir
        .read_dir_utf8()
        .with_context(|| format!("Failed to list {repodir}"))?
    {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let pkgdir = entry.path();
        if !pkgdir.join(RECIPE_FILE).exists() {
            continue;
        }
        let pkgbase = Pkgbase::from(entry.file_name());
        match load(pkgdir) {
            Ok(recipe) => {
                recipes.insert(pkgbase, recipe);
            }
            Err(e) => errors.push((pkgbase, e)),
        }
    }

    tracing::debug!(
        "Loaded {} recipes, {} failed to load",
        recipes.len(),
        errors.len()
    );
    Ok((recipes, errors))
}
