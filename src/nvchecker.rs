//! Interface to the external upstream version checker.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::process::Stdio;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use tokio::process::Command;

use crate::Pkgbase;
use crate::recipe::Recipe;

/// The checker's verdict for one package.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct NvResult {
    /// Last version recorded by a previous `take`; absent for packages
    /// checked for the first time.
    pub oldver: Option<String>,
    pub newver: String,
}

#[derive(Debug, Default, Clone)]
pub struct NvResults {
    pub results: HashMap<Pkgbase, NvResult>,
    /// No verdict this cycle; ineligible for version-driven builds.
    pub unknown: HashSet<Pkgbase>,
    /// Flagged for rebuild independent of version equality.
    pub rebuild: HashSet<Pkgbase>,
}

#[allow(async_fn_in_trait)]
pub trait VersionChecker {
    async fn check(&mut self, recipes: &HashMap<Pkgbase, Recipe>) -> Result<NvResults>;

    /// Durably advance the recorded upstream versions to the detected
    /// newvers for the given packages.
    fn take(&mut self, picks: &HashSet<Pkgbase>) -> Result<()>;
}

const OLDVER_FILE: &str = "oldver.json";
const NEWVER_FILE: &str = "newver.json";

#[derive(Serialize, Deserialize, Debug, Default)]
struct VersionFile {
    version: u32,
    #[serde(default)]
    data: HashMap<String, VersionEntry>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
struct VersionEntry {
    version: String,
    #[serde(default)]
    rebuild: bool,
}

/// Drives the `nvchecker` tool with a config generated from the recipes'
/// `[update]` tables.
pub struct Nvchecker {
    statedir: Utf8PathBuf,
    proxy: Option<String>,
}

impl Nvchecker {
    pub fn new(statedir: impl Into<Utf8PathBuf>, proxy: Option<String>) -> Self {
        Nvchecker {
            statedir: statedir.into(),
            proxy,
        }
    }

    fn oldver_path(&self) -> Utf8PathBuf {
        self.statedir.join(OLDVER_FILE)
    }

    fn newver_path(&self) -> Utf8PathBuf {
        self.statedir.join(NEWVER_FILE)
    }

    fn write_checker_config(&self, recipes: &HashMap<Pkgbase, Recipe>) -> Result<Utf8PathBuf> {
        let mut root = toml::Table::new();
        let mut meta = toml::Table::new();
        meta.insert("oldver".into(), self.oldver_path().as_str().into());
        meta.insert("newver".into(), self.newver_path().as_str().into());
        root.insert("__config__".into(), toml::Value::Table(meta));

        let mut names: Vec<&Pkgbase> = recipes.keys().collect();
        names.sort();
        for pkgbase in names {
            if let Some(update) = &recipes[pkgbase].update {
                root.insert(
                    pkgbase.to_string(),
                    toml::Value::Table(update.clone()),
                );
            }
        }

        let path = self.statedir.join("nvchecker.toml");
        fs::write(&path, toml::to_string(&root)?)
            .with_context(|| format!("Failed to write {path}"))?;
        Ok(path)
    }
}

impl VersionChecker for Nvchecker {
    async fn check(&mut self, recipes: &HashMap<Pkgbase, Recipe>) -> Result<NvResults> {
        fs::create_dir_all(&self.statedir)
            .with_context(|| format!("Failed to create {}", self.statedir))?;
        let config_path = self.write_checker_config(recipes)?;

        let mut cmd = Command::new("nvchecker");
        cmd.args(["-c", config_path.as_str(), "--logger", "json"]);
        cmd.stdout(Stdio::null());
        if let Some(proxy) = &self.proxy {
            cmd.env("http_proxy", proxy).env("https_proxy", proxy);
        }
        tracing::info!("Checking upstream versions of {} packages", recipes.len());
        let status = cmd.status().await.context("Failed to run nvchecker")?;
        if !status.success() {
            // Individual source errors surface as missing newver entries;
            // those packages land in the unknown set below.
            tracing::warn!("nvchecker exited with {status}");
        }

        let oldver = read_version_file(&self.oldver_path())?;
        let newver = read_version_file(&self.newver_path())?;

        let mut results = HashMap::new();
        let mut rebuild = HashSet::new();
        for (name, entry) in &newver.data {
            let pkgbase = Pkgbase::from(name.as_str());
            if !recipes.contains_key(&pkgbase) {
                continue;
            }
            if entry.rebuild {
                rebuild.insert(pkgbase.clone());
            }
            results.insert(
                pkgbase,
                NvResult {
                    oldver: oldver.data.get(name).map(|e| e.version.clone()),
                    newver: entry.version.clone(),
                },
            );
        }

        let unknown: HashSet<Pkgbase> = recipes
            .keys()
            .filter(|p| !results.contains_key(*p))
            .cloned()
            .collect();
        for pkgbase in &unknown {
            tracing::warn!("No upstream version verdict for {pkgbase}");
        }

        Ok(NvResults {
            results,
            unknown,
            rebuild,
        })
    }

    fn take(&mut self, picks: &HashSet<Pkgbase>) -> Result<()> {
        let newver = read_version_file(&self.newver_path())?;
        let mut oldver = read_version_file(&self.oldver_path())?;
        oldver.version = 2;

        for pkgbase in picks {
            let Some(entry) = newver.data.get(pkgbase.as_ref()) else {
                tracing::warn!("Cannot advance {pkgbase}: no new version recorded");
                continue;
            };
            oldver
                .data
                .insert(pkgbase.to_string(), entry.clone());
        }

        write_version_file(&self.oldver_path(), &oldver)
    }
}

fn read_version_file(path: &Utf8Path) -> Result<VersionFile> {
    if !path.exists() {
        return Ok(VersionFile {
            version: 2,
            data: HashMap::new(),
        });
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("Failed to read {path}"))?;
    serde_json::from_str(&content).with_context(|| format!("Failed to parse {path}"))
}

fn write_version_file(path: &Utf8Path, file: &VersionFile) -> Result<()> {
    let tmp = Utf8PathBuf::from(format!("{path}.tmp"));
    fs::write(&tmp, serde_json::to_vec_pretty(file)?)
        .with_context(|| format!("Failed to write {tmp}"))?;
    fs::rename(&tmp, path).with_context(|| format!("Failed to move {tmp} into place"))?;
    Ok(())
}
