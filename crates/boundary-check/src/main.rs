use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::Hash;

use anyhow::{Context, Result};
use cargo_metadata::{DependencyKind, MetadataCommand};

/// Crates that must stay free of I/O: each may not reach the listed
/// packages through its normal (non-dev) dependency graph.
const LAYERING_RULES: &[(&str, &[&str])] = &[
    (
        "urlinfo-contracts",
        &["urlinfo-policy", "urlinfo-store", "sqlx", "tokio", "axum"],
    ),
    ("urlinfo-policy", &["urlinfo-store", "sqlx", "tokio", "axum"]),
];

fn main() -> Result<()> {
    let metadata = MetadataCommand::new()
        .exec()
        .context("failed to run `cargo metadata`")?;

    let resolve = metadata
        .resolve
        .as_ref()
        .context("`cargo metadata` did not include a resolved dependency graph")?;

    let id_to_name: HashMap<_, _> = metadata
        .packages
        .iter()
        .map(|p| (p.id.clone(), p.name.as_str()))
        .collect();

    let adjacency: HashMap<_, _> = resolve
        .nodes
        .iter()
        .map(|node| {
            let deps: Vec<_> = node
                .deps
                .iter()
                .filter(|dep| {
                    dep.dep_kinds
                        .iter()
                        .any(|info| info.kind == DependencyKind::Normal)
                })
                .map(|dep| dep.pkg.clone())
                .collect();
            (node.id.clone(), deps)
        })
        .collect();

    let mut failed = false;
    for (package_name, forbidden) in LAYERING_RULES {
        let package = metadata
            .packages
            .iter()
            .find(|p| p.name == *package_name)
            .with_context(|| format!("package `{}` not found in workspace", package_name))?;

        let violations = forbidden_reachable(&package.id, &adjacency, &id_to_name, forbidden);
        if violations.is_empty() {
            println!(
                "OK: `{}` has no dependency edge to {}",
                package_name,
                forbidden.join(", ")
            );
        } else {
            eprintln!(
                "FAIL: `{}` depends on forbidden crate(s): {}",
                package_name,
                violations.join(", ")
            );
            failed = true;
        }
    }

    if failed {
        std::process::exit(1);
    }

    Ok(())
}

fn forbidden_reachable<K>(
    root: &K,
    adjacency: &HashMap<K, Vec<K>>,
    id_to_name: &HashMap<K, &str>,
    forbidden: &[&str],
) -> Vec<String>
where
    K: Clone + Eq + Hash,
{
    let mut visited = HashSet::new();
    let mut queue = VecDeque::new();
    queue.push_back(root.clone());
    visited.insert(root.clone());

    let mut violations = Vec::new();

    while let Some(current) = queue.pop_front() {
        let Some(deps) = adjacency.get(&current) else {
            continue;
        };

        for dep in deps.iter().cloned() {
            if !visited.insert(dep.clone()) {
                continue;
            }

            if let Some(name) = id_to_name.get(&dep)
                && forbidden.contains(name)
            {
                violations.push((*name).to_string());
            }

            queue.push_back(dep);
        }
    }

    violations.sort();
    violations.dedup();
    violations
}
