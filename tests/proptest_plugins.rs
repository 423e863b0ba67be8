//! Property tests for plugin dependency resolution.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use polyql::error::PluginError;
use polyql::kernel::{InstallContext, Plugin, PluginManager};
use proptest::prelude::*;

struct Node {
    name: String,
    deps: Vec<String>,
}

#[async_trait]
impl Plugin for Node {
    fn name(&self) -> &str {
        &self.name
    }

    fn version(&self) -> &str {
        "0.0.1"
    }

    fn dependencies(&self) -> Vec<String> {
        self.deps.clone()
    }

    async fn install(&self, _ctx: &mut InstallContext<'_>) -> anyhow::Result<()> {
        Ok(())
    }
}

fn name(i: usize) -> String {
    format!("p{i}")
}

/// A DAG over `n` plugins (edges only point to lower indices), plus a
/// registration order.
fn arb_dag() -> impl Strategy<Value = (Vec<Vec<usize>>, Vec<usize>)> {
    (1..12usize).prop_flat_map(|n| {
        let edges = (0..n)
            .map(|i| prop::collection::btree_set(0..i.max(1), 0..=i.min(3)))
            .collect::<Vec<_>>();
        let order = Just((0..n).collect::<Vec<_>>()).prop_shuffle();
        (edges, order).prop_map(|(edges, order)| {
            let deps = edges
                .into_iter()
                .enumerate()
                .map(|(i, set)| set.into_iter().filter(|&d| d < i).collect())
                .collect();
            (deps, order)
        })
    })
}

fn kernel(deps: &[Vec<usize>], order: &[usize]) -> PluginManager {
    let mut kernel = PluginManager::default();
    for &i in order {
        kernel
            .register(Arc::new(Node {
                name: name(i),
                deps: deps[i].iter().map(|&d| name(d)).collect(),
            }))
            .unwrap();
    }
    kernel
}

proptest! {
    #[test]
    fn resolution_respects_every_edge((deps, order) in arb_dag()) {
        let resolved = kernel(&deps, &order).resolve_dependencies().unwrap();
        prop_assert_eq!(resolved.len(), deps.len());

        let position: HashMap<&str, usize> = resolved
            .iter()
            .enumerate()
            .map(|(pos, n)| (n.as_str(), pos))
            .collect();
        for (i, ds) in deps.iter().enumerate() {
            for &d in ds {
                prop_assert!(position[name(d).as_str()] < position[name(i).as_str()]);
            }
        }
    }

    #[test]
    fn resolution_is_deterministic((deps, order) in arb_dag()) {
        let first = kernel(&deps, &order).resolve_dependencies().unwrap();
        let second = kernel(&deps, &order).resolve_dependencies().unwrap();
        prop_assert_eq!(first, second);
    }

    #[test]
    fn cycles_name_every_member(
        (deps, order) in arb_dag(),
        ring in 1..5usize,
    ) {
        // Close a ring over fresh plugins c0 -> c1 -> ... -> c0.
        let mut kernel = kernel(&deps, &order);
        for k in 0..ring {
            kernel
                .register(Arc::new(Node {
                    name: format!("c{k}"),
                    deps: vec![format!("c{}", (k + 1) % ring)],
                }))
                .unwrap();
        }
        match kernel.resolve_dependencies() {
            Err(PluginError::Cycle { cycle }) => {
                prop_assert_eq!(cycle.len(), ring + 1);
                prop_assert_eq!(cycle.first(), cycle.last());
                for k in 0..ring {
                    let member = format!("c{k}");
                    prop_assert!(cycle.contains(&member));
                }
            }
            other => prop_assert!(false, "expected a cycle, got {:?}", other),
        }
    }
}
