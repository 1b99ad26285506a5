use std::collections::{HashMap, HashSet};

use eups_man_lib::error::EupsError;
use itertools::Itertools;
use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};

use crate::data::Product;
use crate::report::WarningSink;
use crate::resolve::DependencyNode;

/// Policy for graphs containing mutually dependent products.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OnCycle {
    Fail,
    Warn,
}

impl Default for OnCycle {
    fn default() -> Self {
        OnCycle::Warn
    }
}

/// One strongly connected component of the dependency graph, emitted as
/// an atomic unit. `cycle` is set when the component holds more than one
/// product; its members are ordered lexically by name.
#[derive(Clone, Debug, PartialEq)]
pub struct Group {
    products: Vec<Product>,
    cycle: bool,
}

impl Group {
    pub fn products(&self) -> &[Product] {
        &self.products
    }

    pub fn is_cycle(&self) -> bool {
        self.cycle
    }

    fn names(&self) -> String {
        self.products.iter().map(|product| product.to_string()).join(", ")
    }
}

/// A layer of groups with no remaining dependents, ordered lexically by
/// their first product for determinism.
pub type Layer = Vec<Group>;

/// Linearize a dependency graph into layers. Groups are Tarjan SCCs; the
/// condensation is peeled Kahn-style, each round emitting the components
/// nothing left depends on. Iterating the result in reverse therefore
/// visits every product after all of its prerequisites.
pub fn sort(
    graph: &DiGraph<DependencyNode, ()>,
    on_cycle: OnCycle,
    sink: &dyn WarningSink,
) -> Result<Vec<Layer>, EupsError> {
    let components = tarjan_scc(graph);

    let mut groups: Vec<Group> = Vec::with_capacity(components.len());
    let mut component_of: HashMap<NodeIndex, usize> = HashMap::new();
    for (id, members) in components.iter().enumerate() {
        for index in members {
            component_of.insert(*index, id);
        }

        let products: Vec<Product> = members
            .iter()
            .map(|index| graph[*index].product.clone())
            .sorted_by(|a, b| a.name().cmp(b.name()))
            .collect();
        let group = Group {
            cycle: products.len() > 1,
            products,
        };

        if group.is_cycle() {
            match on_cycle {
                OnCycle::Fail => return Err(EupsError::CyclicDependency(group.names())),
                OnCycle::Warn => sink.warn(&format!("Detected cycle: {}", group.names())),
            }
        }
        groups.push(group);
    }

    // Condensation: unique component edges, self-dependencies dropped.
    let mut edges: HashSet<(usize, usize)> = HashSet::new();
    for edge in graph.edge_indices() {
        let (source, target) = graph.edge_endpoints(edge).expect("edge endpoints");
        let from = component_of[&source];
        let to = component_of[&target];
        if from != to {
            edges.insert((from, to));
        }
    }

    let mut in_degree = vec![0usize; groups.len()];
    for (_, to) in &edges {
        in_degree[*to] += 1;
    }

    let mut remaining: HashSet<usize> = (0..groups.len()).collect();
    let mut layers: Vec<Layer> = Vec::new();
    while !remaining.is_empty() {
        let ready: Vec<usize> = remaining
            .iter()
            .copied()
            .filter(|id| in_degree[*id] == 0)
            .collect();
        if ready.is_empty() {
            // The condensation is a DAG by construction, so running dry
            // with components left means the computation is corrupted.
            let stuck = remaining
                .iter()
                .flat_map(|id| groups[*id].products.iter().map(Product::to_string))
                .sorted()
                .join(", ");
            return Err(EupsError::CyclicDependency(stuck));
        }

        for id in &ready {
            remaining.remove(id);
            for (from, to) in &edges {
                if from == id && remaining.contains(to) {
                    in_degree[*to] -= 1;
                }
            }
        }

        let layer: Layer = ready
            .into_iter()
            .map(|id| groups[id].clone())
            .sorted_by(|a, b| {
                a.products
                    .first()
                    .map(Product::name)
                    .cmp(&b.products.first().map(Product::name))
            })
            .collect();
        layers.push(layer);
    }

    Ok(layers)
}

#[cfg(test)]
mod tests {
    use crate::report::LogSink;

    use super::*;

    fn node(name: &str) -> DependencyNode {
        DependencyNode {
            product: Product::new(name, "1.0", "Linux", "/eups/db"),
            optional: false,
            depth: 0,
        }
    }

    fn build(names: &[&str], edges: &[(usize, usize)]) -> DiGraph<DependencyNode, ()> {
        let mut graph = DiGraph::new();
        let indexes: Vec<NodeIndex> = names.iter().map(|name| graph.add_node(node(name))).collect();
        for (from, to) in edges {
            graph.add_edge(indexes[*from], indexes[*to], ());
        }
        graph
    }

    fn layer_names(layers: &[Layer]) -> Vec<Vec<Vec<String>>> {
        layers
            .iter()
            .map(|layer| {
                layer
                    .iter()
                    .map(|group| {
                        group
                            .products()
                            .iter()
                            .map(|product| String::from(product.name()))
                            .collect()
                    })
                    .collect()
            })
            .collect()
    }

    #[test]
    fn linear_chain_peels_dependents_first() {
        let graph = build(&["a", "b", "c"], &[(0, 1), (1, 2)]);
        let layers = sort(&graph, OnCycle::Warn, &LogSink::default()).unwrap();
        assert_eq!(
            layer_names(&layers),
            vec![
                vec![vec![String::from("a")]],
                vec![vec![String::from("b")]],
                vec![vec![String::from("c")]],
            ]
        );
    }

    #[test]
    fn cycle_collapses_into_one_flagged_group() {
        // {a → b, b → c, c → a, d → a}
        let graph = build(&["a", "b", "c", "d"], &[(0, 1), (1, 2), (2, 0), (3, 0)]);
        let layers = sort(&graph, OnCycle::Warn, &LogSink::default()).unwrap();

        assert_eq!(
            layer_names(&layers),
            vec![
                vec![vec![String::from("d")]],
                vec![vec![String::from("a"), String::from("b"), String::from("c")]],
            ]
        );
        assert!(!layers[0][0].is_cycle());
        assert!(layers[1][0].is_cycle());
    }

    #[test]
    fn cycle_fails_under_the_strict_policy() {
        let graph = build(&["a", "b"], &[(0, 1), (1, 0)]);
        let err = sort(&graph, OnCycle::Fail, &LogSink::default()).unwrap_err();
        assert!(matches!(err, EupsError::CyclicDependency(_)));
    }

    #[test]
    fn self_dependency_is_not_a_cycle() {
        let graph = build(&["a", "b"], &[(0, 0), (0, 1)]);
        let layers = sort(&graph, OnCycle::Fail, &LogSink::default()).unwrap();
        assert_eq!(layers.len(), 2);
        assert!(layers.iter().flatten().all(|group| !group.is_cycle()));
    }

    #[test]
    fn independent_groups_share_a_layer_in_lexical_order() {
        let graph = build(&["root", "beta", "alpha"], &[(0, 1), (0, 2)]);
        let layers = sort(&graph, OnCycle::Warn, &LogSink::default()).unwrap();
        assert_eq!(
            layer_names(&layers),
            vec![
                vec![vec![String::from("root")]],
                vec![vec![String::from("alpha")], vec![String::from("beta")]],
            ]
        );
    }

    #[test]
    fn reversed_layers_respect_every_edge() {
        // Diamond with a tail: a → {b, c} → d → e.
        let graph = build(
            &["a", "b", "c", "d", "e"],
            &[(0, 1), (0, 2), (1, 3), (2, 3), (3, 4)],
        );
        let layers = sort(&graph, OnCycle::Warn, &LogSink::default()).unwrap();

        let position: std::collections::HashMap<String, usize> = layers
            .iter()
            .rev()
            .enumerate()
            .flat_map(|(position, layer)| {
                layer.iter().flat_map(move |group| {
                    group
                        .products()
                        .iter()
                        .map(move |product| (String::from(product.name()), position))
                })
            })
            .collect();

        // In consumption (reversed) order every prerequisite comes first.
        for (dependent, prerequisite) in [("a", "b"), ("a", "c"), ("b", "d"), ("c", "d"), ("d", "e")] {
            assert!(position[prerequisite] < position[dependent]);
        }
    }
}
