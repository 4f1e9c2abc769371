//! Turn the detected building set into an ordered, validated plan.

use std::collections::{HashMap, HashSet};

use anyhow::Result;

use crate::Pkgbase;
use crate::dep_graph::{Dep, DepMap, build_order, expand_building_set};
use crate::pacman_repo::PackageDatabase;
use crate::recipe::Recipe;

#[derive(Debug, Default)]
pub struct BuildPlan {
    /// Dependencies precede dependents; each package appears once.
    pub order: Vec<Pkgbase>,
    /// Managed deps per planned package, for pre-build installation.
    pub depends: HashMap<Pkgbase, Vec<Dep>>,
    /// Deps that neither the repository nor the system database can
    /// satisfy, keyed by the package declaring them.
    pub nonexistent: HashMap<Pkgbase, Vec<Dep>>,
}

pub fn plan(
    all_building: &HashSet<Pkgbase>,
    recipes: &HashMap<Pkgbase, Recipe>,
    depmap: &DepMap,
    db: &dyn PackageDatabase,
) -> Result<BuildPlan> {
    let building = expand_building_set(all_building, depmap);

    let mut depends: HashMap<Pkgbase, Vec<Dep>> = HashMap::new();
    let mut nonexistent: HashMap<Pkgbase, Vec<Dep>> = HashMap::new();
    for pkgbase in &building {
        let Some(deps) = depmap.get(pkgbase) else {
            continue;
        };
        for dep in deps {
            if depmap.contains_key(&dep.pkgname) {
                depends
                    .entry(pkgbase.clone())
                    .or_default()
                    .push(dep.clone());
            } else if !dep.resolvable(recipes, db) {
                nonexistent
                    .entry(pkgbase.clone())
                    .or_default()
                    .push(dep.clone());
            }
        }
    }

    let order = build_order(&building, depmap)?;

    Ok(BuildPlan {
        order,
        depends,
        nonexistent,
    })
}
