//! Console joins: correlate small indexed collections client-side.
//!
//! The main one attaches the owning backing service name (`bsName`) to every
//! backing service instance whose provisioning plan guid appears in that
//! service's plan list. Reference collections iterate in key order, so when two
//! services declare the same plan id the lexicographically smallest name wins.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use console_core::{IndexedCollection, Resource};
use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use tracing::debug;

/// Derived label set on enriched instances.
pub const BS_NAME: &str = "bsName";

/// Nested plan list on a reference resource; each entry carries an `id`.
pub const PLANS_PATH: &str = "spec.plans";

/// Join key locations on a primary resource, tried in order.
pub const PLAN_GUID_PATHS: [&str; 2] = [
    "spec.provisioning.backingserviceinstance_plan_guid",
    "spec.provisioning.backingservice_plan_guid",
];

/// Extract the provisioning plan guid used as join key.
pub fn plan_guid(res: &Resource) -> Option<&str> {
    PLAN_GUID_PATHS.iter().find_map(|p| res.field_str(p).filter(|s| !s.is_empty()))
}

fn plan_ids(res: &Resource) -> impl Iterator<Item = &str> {
    res.field(PLANS_PATH)
        .and_then(|v| v.as_array())
        .into_iter()
        .flatten()
        .filter_map(|plan| plan.get("id").and_then(|id| id.as_str()))
}

/// Name of the first reference entry whose plan list contains `key` (exact match).
pub fn match_reference<'a>(reference: &'a IndexedCollection, key: &str) -> Option<&'a str> {
    reference
        .iter()
        .find(|(_, res)| plan_ids(res).any(|id| id == key))
        .map(|(name, _)| name)
}

/// Plan id to reference names, built once per reference collection.
#[derive(Debug, Default)]
pub struct PlanIndex<'a> {
    by_plan: FxHashMap<&'a str, SmallVec<[&'a str; 2]>>,
}

impl<'a> PlanIndex<'a> {
    pub fn build(reference: &'a IndexedCollection) -> Self {
        let mut by_plan: FxHashMap<&'a str, SmallVec<[&'a str; 2]>> = FxHashMap::default();
        for (name, res) in reference.iter() {
            for id in plan_ids(res) {
                let owners = by_plan.entry(id).or_default();
                if !owners.contains(&name) {
                    owners.push(name);
                }
            }
        }
        Self { by_plan }
    }

    /// Same answer as [`match_reference`] without rescanning.
    pub fn lookup(&self, key: &str) -> Option<&'a str> {
        self.by_plan.get(key).and_then(|owners| owners.first().copied())
    }

    /// Plan ids declared by more than one reference entry, sorted.
    pub fn ambiguous(&self) -> Vec<&'a str> {
        let mut out: Vec<&'a str> = self.by_plan.iter().filter(|(_, o)| o.len() > 1).map(|(id, _)| *id).collect();
        out.sort_unstable();
        out
    }

    pub fn len(&self) -> usize { self.by_plan.len() }
    pub fn is_empty(&self) -> bool { self.by_plan.is_empty() }
}

/// Attach [`BS_NAME`] to every primary entry with a matching reference entry.
///
/// Entries without a join key or without a match are left untouched.
/// Returns the number of entries labelled.
pub fn enrich(primary: &mut IndexedCollection, reference: &IndexedCollection) -> usize {
    if primary.is_empty() || reference.is_empty() {
        return 0;
    }
    let index = PlanIndex::build(reference);
    for id in index.ambiguous() {
        debug!(plan = %id, "plan id declared by several backing services; using first by name");
    }
    let mut matched = 0usize;
    for (_, res) in primary.iter_mut() {
        let Some(name) = plan_guid(res).and_then(|guid| index.lookup(guid)) else { continue };
        res.set_derived(BS_NAME, name);
        matched += 1;
    }
    metrics::counter!("console_enrich_matched_total", matched as u64);
    debug!(primary = primary.len(), reference = reference.len(), matched, "enrich done");
    matched
}

/// True when a route targets an application (`spec.to.kind == "Application"`).
fn app_target(route: &Resource) -> Option<&str> {
    match route.field_str("spec.to.kind") {
        Some("Application") => route.field_str("spec.to.name"),
        _ => None,
    }
}

/// Group routes by the application they point at.
pub fn routes_by_app(routes: &IndexedCollection) -> BTreeMap<String, IndexedCollection> {
    let mut out: BTreeMap<String, IndexedCollection> = BTreeMap::new();
    for (name, route) in routes.iter() {
        if let Some(app) = app_target(route) {
            out.entry(app.to_string()).or_default().insert(name, route.clone());
        }
    }
    out
}

/// Routes pointing at `app`, in route-name order.
pub fn routes_for_app<'a>(routes: &'a IndexedCollection, app: &str) -> Vec<&'a Resource> {
    routes.values().filter(|r| app_target(r) == Some(app)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use console_core::{RawCollection, NAME_PATH};
    use serde_json::json;

    fn service(name: &str, plans: &[&str]) -> Resource {
        let plans: Vec<_> = plans.iter().map(|id| json!({ "id": id, "name": format!("plan-{id}") })).collect();
        Resource::new(json!({ "metadata": { "name": name }, "spec": { "plans": plans } }))
    }

    fn index(items: Vec<Resource>) -> IndexedCollection {
        RawCollection(items).by(NAME_PATH)
    }

    #[test]
    fn match_is_exact() {
        let refs = index(vec![service("svcA", &["g1", "g10"])]);
        assert_eq!(match_reference(&refs, "g1"), Some("svcA"));
        assert_eq!(match_reference(&refs, "g"), None);
        assert_eq!(match_reference(&refs, "g9"), None);
    }

    #[test]
    fn duplicate_plan_ids_resolve_to_smallest_name() {
        let refs = index(vec![service("zeta", &["dup"]), service("alpha", &["dup"])]);
        assert_eq!(match_reference(&refs, "dup"), Some("alpha"));
        let idx = PlanIndex::build(&refs);
        assert_eq!(idx.lookup("dup"), Some("alpha"));
        assert_eq!(idx.ambiguous(), vec!["dup"]);
    }

    #[test]
    fn plan_guid_falls_back_to_server_field() {
        let r = Resource::new(json!({ "spec": { "provisioning": { "backingservice_plan_guid": "g2" } } }));
        assert_eq!(plan_guid(&r), Some("g2"));
        let blank = Resource::new(json!({ "spec": { "provisioning": { "backingserviceinstance_plan_guid": "" } } }));
        assert_eq!(plan_guid(&blank), None);
    }

    #[test]
    fn blank_first_field_does_not_hide_the_second() {
        let r = Resource::new(json!({ "spec": { "provisioning": {
            "backingserviceinstance_plan_guid": "",
            "backingservice_plan_guid": "g2",
        } } }));
        assert_eq!(plan_guid(&r), Some("g2"));
    }

    #[test]
    fn services_without_plans_are_ignored() {
        let refs = index(vec![Resource::new(json!({ "metadata": { "name": "bare" }, "spec": {} }))]);
        assert!(PlanIndex::build(&refs).is_empty());
        assert_eq!(match_reference(&refs, "g1"), None);
    }
}
