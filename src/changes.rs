//! Decide which packages need to go into this cycle's build set.

use std::collections::{HashMap, HashSet};

use crate::Pkgbase;
use crate::nvchecker::NvResult;
use crate::recipe::Recipe;

/// Everything the change detector looks at. All maps are keyed by pkgbase;
/// `changed` and `pkgrel_bumped` come from the VCS diff between the last
/// fully processed commit and HEAD.
pub struct ChangeInput<'a> {
    pub recipes: &'a HashMap<Pkgbase, Recipe>,
    pub nv: &'a HashMap<Pkgbase, NvResult>,
    /// Packages the checker could not produce a verdict for.
    pub unknown: &'a HashSet<Pkgbase>,
    /// Packages flagged for rebuild independent of version equality.
    pub rebuild: &'a HashSet<Pkgbase>,
    /// Failure record from the persistent store.
    pub failed: &'a HashMap<Pkgbase, Option<String>>,
    pub changed: &'a HashSet<Pkgbase>,
    pub pkgrel_bumped: &'a HashSet<Pkgbase>,
}

#[derive(Debug, Default, Clone)]
pub struct Detected {
    /// Upstream moved: new version, or a failed package whose version
    /// moved past the recorded failure.
    pub need_update: HashSet<Pkgbase>,
    pub need_rebuild_failed: HashSet<Pkgbase>,
    pub need_rebuild_pkgrel: HashSet<Pkgbase>,
    pub all_building: HashSet<Pkgbase>,
}

pub fn detect(input: &ChangeInput<'_>) -> Detected {
    let managed = |p: &&Pkgbase| input.recipes.contains_key(*p);

    let updated: HashSet<Pkgbase> = input
        .nv
        .iter()
        .filter(|(p, result)| {
            input.recipes.contains_key(*p) && result.oldver.as_deref() != Some(&result.newver)
        })
        .map(|(p, _)| p.clone())
        .collect();

    let failed_updated: HashSet<Pkgbase> = input
        .failed
        .iter()
        .filter(|(p, last_attempted)| {
            input.recipes.contains_key(*p)
                && input
                    .nv
                    .get(*p)
                    .is_some_and(|result| last_attempted.as_deref() != Some(&result.newver))
        })
        .map(|(p, _)| p.clone())
        .collect();

    let need_rebuild_failed: HashSet<Pkgbase> = input
        .failed
        .keys()
        .filter(|p| input.changed.contains(*p))
        .filter(managed)
        .cloned()
        .collect();

    // A pkgrel bump alone is no reason to rebuild something whose upstream
    // version we cannot determine.
    let mut need_rebuild_pkgrel = HashSet::new();
    for pkgbase in input.pkgrel_bumped.intersection(input.changed) {
        if !input.recipes.contains_key(pkgbase) {
            continue;
        }
        if input.unknown.contains(pkgbase) {
            tracing::warn!(
                "Not rebuilding {pkgbase} for its pkgrel bump: upstream version unknown"
            );
            continue;
        }
        need_rebuild_pkgrel.insert(pkgbase.clone());
    }

    let need_update: HashSet<Pkgbase> = updated.union(&failed_updated).cloned().collect();

    let mut all_building = need_update.clone();
    all_building.extend(need_rebuild_failed.iter().cloned());
    all_building.extend(need_rebuild_pkgrel.iter().cloned());
    all_building.extend(input.rebuild.iter().filter(managed).cloned());

    Detected {
        need_update,
        need_rebuild_failed,
        need_rebuild_pkgrel,
        all_building,
    }
}
