//! Structural dependency information between managed packages.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

use anyhow::{Result, bail};
use camino::{Utf8Path, Utf8PathBuf};
use petgraph::algo::toposort;
use petgraph::graph::{Graph, NodeIndex};

use crate::Pkgbase;
use crate::pacman_repo::PackageDatabase;
use crate::recipe::Recipe;

/// A declared dependency on another package, which may be managed in this
/// repository or provided externally.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Dep {
    pub pkgname: Pkgbase,
    /// Resolved working-directory path for the target package.
    pub pkgdir: Utf8PathBuf,
}

impl Dep {
    pub fn new(pkgname: impl Into<Pkgbase>, repodir: &Utf8Path) -> Self {
        let pkgname = pkgname.into();
        let pkgdir = repodir.join(pkgname.as_ref());
        Dep { pkgname, pkgdir }
    }

    /// True iff the dependency currently exists: either as a managed
    /// package in this repository or in the system package database.
    pub fn resolvable(
        &self,
        managed: &HashMap<Pkgbase, Recipe>,
        db: &dyn PackageDatabase,
    ) -> bool {
        managed.contains_key(&self.pkgname) || db.provides(self.pkgname.as_ref())
    }
}

/// Direct dependencies of every managed package.
pub type DepMap = HashMap<Pkgbase, Vec<Dep>>;

pub fn build_dep_map(recipes: &HashMap<Pkgbase, Recipe>, repodir: &Utf8Path) -> DepMap {
    recipes
        .iter()
        .map(|(pkgbase, recipe)| {
            let deps = recipe
                .repo_depends
                .iter()
                .map(|name| Dep::new(name.as_str(), repodir))
                .collect();
            (pkgbase.clone(), deps)
        })
        .collect()
}

/// Smallest superset of `seed` closed under managed dependencies: for every
/// member, every dep that is itself a key of the dep map joins the set.
/// Unmanaged deps never expand the set.
pub fn expand_building_set(seed: &HashSet<Pkgbase>, depmap: &DepMap) -> HashSet<Pkgbase> {
    let mut building: HashSet<Pkgbase> = seed.clone();
    let mut queue: VecDeque<Pkgbase> = seed.iter().cloned().collect();

    while let Some(pkgbase) = queue.pop_front() {
        let Some(deps) = depmap.get(&pkgbase) else {
            continue;
        };
        for dep in deps {
            if depmap.contains_key(&dep.pkgname) && building.insert(dep.pkgname.clone()) {
                queue.push_back(dep.pkgname.clone());
            }
        }
    }

    building
}

/// Topological build order: dependencies strictly precede dependents.
///
/// The sort runs over all managed packages reachable from `building`, not
/// just `building` itself, and the result is filtered back afterwards.
/// That way transitively discovered managed deps end up ordered correctly
/// even when the input set drifted from the intended universe. Nodes are
/// inserted in lexicographic order so equal inputs give equal orders.
pub fn build_order(building: &HashSet<Pkgbase>, depmap: &DepMap) -> Result<Vec<Pkgbase>> {
    let universe: BTreeSet<Pkgbase> = expand_building_set(building, depmap)
        .into_iter()
        .collect();

    let mut graph: Graph<Pkgbase, ()> = Graph::new();
    let mut indices: HashMap<Pkgbase, NodeIndex> = HashMap::new();
    for pkgbase in &universe {
        indices.insert(pkgbase.clone(), graph.add_node(pkgbase.clone()));
    }
    for pkgbase in &universe {
        let Some(deps) = depmap.get(pkgbase) else {
            continue;
        };
        for dep in deps {
            if let Some(&dep_index) = indices.get(&dep.pkgname) {
                graph.add_edge(dep_index, indices[pkgbase], ());
            }
        }
    }

    let sorted = match toposort(&graph, None) {
        Ok(sorted) => sorted,
        Err(cycle) => {
            bail!(
                "dependency cycle among managed packages involving {}",
                graph[cycle.node_id()]
            );
        }
    };

    Ok(sorted
        .into_iter()
        .map(|index| graph[index].clone())
        .filter(|pkgbase| building.contains(pkgbase))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recipe(depends: &[&str]) -> Recipe {
        toml::from_str::<Recipe>(&format!(
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
        ))
        .unwrap()
    }

    fn depmap(entries: &[(&str, &[&str])]) -> DepMap {
        let repodir = Utf8Path::new("/srv/repo");
        let recipes: HashMap<Pkgbase, Recipe> = entries
            .iter()
            .map(|(name, deps)| (Pkgbase::from(*name), recipe(deps)))
            .collect();
        build_dep_map(&recipes, repodir)
    }

    fn set(names: &[&str]) -> HashSet<Pkgbase> {
        names.iter().map(|n| Pkgbase::from(*n)).collect()
    }

    #[test]
    fn closure_follows_managed_deps_only() {
        let depmap = depmap(&[
            ("app", &["lib", "glibc"]),
            ("lib", &["core"]),
            ("core", &[]),
            ("unrelated", &[]),
        ]);
        let building = expand_building_set(&set(&["app"]), &depmap);
        // glibc is unmanaged and must not expand the set.
        assert_eq!(building, set(&["app", "lib", "core"]));
    }

    #[test]
    fn order_puts_dependencies_first() {
        let depmap = depmap(&[("app", &["lib"]), ("lib", &["core"]), ("core", &[])]);
        let building = set(&["app", "lib", "core"]);
        let order = build_order(&building, &depmap).unwrap();
        assert_eq!(order.len(), 3);
        let index = |name: &str| {
            order
                .iter()
                .position(|p| p == &Pkgbase::from(name))
                .unwrap()
        };
        assert!(index("core") < index("lib"));
        assert!(index("lib") < index("app"));
    }

    #[test]
    fn order_is_deterministic_for_unrelated_packages() {
        let depmap = depmap(&[("zsh", &[]), ("bash", &[]), ("fish", &[])]);
        let building = set(&["zsh", "bash", "fish"]);
        let order = build_order(&building, &depmap).unwrap();
        assert_eq!(
            order,
            vec![
                Pkgbase::from("bash"),
                Pkgbase::from("fish"),
                Pkgbase::from("zsh")
            ]
        );
    }

    #[test]
    fn order_filters_back_to_the_building_set() {
        // The seed is not closed; the discovered dep orders the output but
        // is filtered from it.
        let depmap = depmap(&[("app", &["lib"]), ("lib", &[])]);
        let order = build_order(&set(&["app"]), &depmap).unwrap();
        assert_eq!(order, vec![Pkgbase::from("app")]);
    }

    #[test]
    fn cycle_is_a_fatal_planning_error() {
        let depmap = depmap(&[("a", &["b"]), ("b", &["a"])]);
        let err = build_order(&set(&["a", "b"]), &depmap).unwrap_err();
        assert!(err.to_string().contains("cycle"));
    }
}
