// src/core/placement.rs

//! `select_service_node` (spec §4.5, C7 sub-routine): picks the best node
//! for a service given its affinity group, current placement, usage scores
//! and a caller-supplied preference.

use crate::core::config_model::{Group, ServiceConfig};
use crate::core::manager_status::ServiceState;
use std::collections::{BTreeMap, HashSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Preference {
    None,
    BestScore,
    TryNext,
}

/// Picks the best online node to run `sid`, or `None` if the effective
/// group has no eligible online node right now (caller retries next tick).
pub fn select_service_node(
    groups: &BTreeMap<String, Group>,
    online: &HashSet<String>,
    scores: &BTreeMap<String, f64>,
    cd: &ServiceConfig,
    sd: &ServiceState,
    preference: Preference,
) -> Option<String> {
    let current_node = sd.node.as_str();

    // Step 1: effective group.
    let synthetic;
    let effective = match cd.group.as_deref().and_then(|name| groups.get(name)) {
        Some(group) => group,
        None => {
            synthetic = Group {
                nodes: online.iter().map(|n| (n.clone(), 0)).collect(),
                restricted: false,
                nofailback: false,
            };
            &synthetic
        }
    };

    // Step 2: priority groups, filtered to online nodes.
    let mut pri_groups: BTreeMap<i64, HashSet<String>> = BTreeMap::new();
    for (node, pri) in &effective.nodes {
        if online.contains(node) {
            pri_groups.entry(*pri).or_default().insert(node.clone());
        }
    }
    if !effective.restricted {
        let named: HashSet<&String> = effective.nodes.keys().collect();
        let others: HashSet<String> = online
            .iter()
            .filter(|n| !named.contains(n))
            .cloned()
            .collect();
        if !others.is_empty() {
            pri_groups.entry(-1).or_default().extend(others);
        }
    }

    // Step 3: top priority level.
    let Some((_, top)) = pri_groups.iter().next_back() else {
        return None;
    };
    let mut top_pri: HashSet<String> = top.clone();

    // Step 4: try-next drops previously-failed nodes.
    if preference == Preference::TryNext {
        for failed in &sd.failed_nodes {
            top_pri.remove(failed);
        }
    }
    if top_pri.is_empty() {
        return None;
    }

    // Step 5: maintenance fallback takes priority over everything else.
    if let Some(maint) = sd.maintenance_node.as_deref() {
        if top_pri.contains(maint) {
            return Some(maint.to_string());
        }
    }

    // Step 6: nofailback keeps the service put.
    if preference == Preference::None
        && effective.nofailback
        && (effective.nodes.contains_key(current_node) || !effective.restricted)
        && online.contains(current_node)
    {
        return Some(current_node.to_string());
    }

    // Step 7: stability; stay if already in the top priority level.
    if preference == Preference::None && top_pri.contains(current_node) {
        return Some(current_node.to_string());
    }

    // Step 8: rank by (score, name) and pick according to preference.
    let mut ranked: Vec<&String> = top_pri.iter().collect();
    ranked.sort_by(|a, b| {
        let sa = scores.get(*a).copied().unwrap_or(f64::MAX);
        let sb = scores.get(*b).copied().unwrap_or(f64::MAX);
        sa.partial_cmp(&sb)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.cmp(b))
    });

    match preference {
        Preference::TryNext => {
            if let Some(pos) = ranked.iter().position(|n| n.as_str() == current_node) {
                let next = (pos + 1) % ranked.len();
                Some(ranked[next].clone())
            } else {
                ranked.first().map(|s| (*s).clone())
            }
        }
        Preference::BestScore | Preference::None => ranked.first().map(|s| (*s).clone()),
    }
}
