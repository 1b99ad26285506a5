use std::collections::HashMap;

use eups_man_lib::error::EupsError;
use eups_man_lib::table::{parse_table, Dependency};
#[cfg(test)]
use mockall::automock;
use petgraph::graph::{DiGraph, NodeIndex};

use crate::data::Product;
use crate::report::WarningSink;

/// Supplies the dependency records of a product. The production
/// implementation reads the product's table file; the table grammar is
/// owned by an external collaborator and only its flattened directives
/// are consumed here.
#[cfg_attr(test, automock)]
pub trait TableProvider {
    fn dependencies(&self, product: &Product) -> Result<Vec<Dependency>, EupsError>;
}

pub struct FileTableProvider;

impl TableProvider for FileTableProvider {
    fn dependencies(&self, product: &Product) -> Result<Vec<Dependency>, EupsError> {
        match product.table_file() {
            Some(path) => parse_table(path),
            None => Ok(Vec::new()),
        }
    }
}

/// Resolves one dependency directive to a declared product. Implemented
/// by the façade, which consults the stack and the tag registry under
/// the active preferred-tag order.
#[cfg_attr(test, automock)]
pub trait ProductSource {
    fn lookup<'a>(&self, name: &str, version_expr: Option<&'a str>) -> Result<Option<Product>, EupsError>;
    fn flavor_name(&self) -> String;
}

/// A resolved product in the graph, labeled with how it was reached.
#[derive(Clone, Debug, PartialEq)]
pub struct DependencyNode {
    pub product: Product,
    pub optional: bool,
    pub depth: u32,
}

/// The resolved graph: edges run from dependent to prerequisite, in table
/// declaration order. Nodes are indexed for O(1) reuse on revisit.
#[derive(Debug)]
pub struct DependencyGraph {
    graph: DiGraph<DependencyNode, ()>,
    by_identity: HashMap<(String, String, String), NodeIndex>,
    by_name: HashMap<String, NodeIndex>,
}

impl DependencyGraph {
    fn new() -> Self {
        DependencyGraph {
            graph: DiGraph::new(),
            by_identity: HashMap::new(),
            by_name: HashMap::new(),
        }
    }

    pub fn graph(&self) -> &DiGraph<DependencyNode, ()> {
        &self.graph
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn nodes(&self) -> impl Iterator<Item = &DependencyNode> {
        self.graph.node_weights()
    }

    pub fn contains(&self, name: &str, version: &str, flavor: &str) -> bool {
        self.by_identity
            .contains_key(&(String::from(name), String::from(version), String::from(flavor)))
    }

    fn index_of(&self, product: &Product) -> Option<NodeIndex> {
        let (name, version, flavor) = product.identity();
        self.by_identity
            .get(&(String::from(name), String::from(version), String::from(flavor)))
            .copied()
    }

    fn add(&mut self, product: Product, optional: bool, depth: u32) -> NodeIndex {
        let (name, version, flavor) = product.identity();
        let key = (String::from(name), String::from(version), String::from(flavor));
        let name_key = String::from(name);

        let index = self.graph.add_node(DependencyNode {
            product,
            optional,
            depth,
        });
        self.by_identity.insert(key, index);
        self.by_name.entry(name_key).or_insert(index);
        index
    }
}

/// What to do when two versions of one product are demanded.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConflictPolicy {
    /// Keep the first binding, warn about the other.
    FirstWins,
    /// Fail the resolution.
    Fail,
}

/// Depth-first resolver over table-file directives.
pub struct Resolver<'a> {
    source: &'a dyn ProductSource,
    tables: &'a dyn TableProvider,
    max_depth: Option<u32>,
    conflicts: ConflictPolicy,
}

impl<'a> Resolver<'a> {
    pub fn new(source: &'a dyn ProductSource, tables: &'a dyn TableProvider) -> Self {
        Resolver {
            source,
            tables,
            max_depth: None,
            conflicts: ConflictPolicy::FirstWins,
        }
    }

    pub fn with_max_depth(mut self, max_depth: u32) -> Self {
        self.max_depth = Some(max_depth);
        self
    }

    pub fn with_conflict_policy(mut self, conflicts: ConflictPolicy) -> Self {
        self.conflicts = conflicts;
        self
    }

    pub fn resolve(&self, root: Product, sink: &dyn WarningSink) -> Result<DependencyGraph, EupsError> {
        let mut graph = DependencyGraph::new();
        self.visit(root, 0, false, &mut graph, sink)?;
        Ok(graph)
    }

    fn visit(
        &self,
        product: Product,
        depth: u32,
        optional: bool,
        graph: &mut DependencyGraph,
        sink: &dyn WarningSink,
    ) -> Result<NodeIndex, EupsError> {
        if let Some(index) = graph.index_of(&product) {
            return Ok(index);
        }

        if let Some(&existing) = graph.by_name.get(product.name()) {
            let bound = graph.graph[existing].product.clone();
            match self.conflicts {
                ConflictPolicy::FirstWins => {
                    sink.warn(&format!(
                        "Dependencies request {} but {} is already in use, keeping the latter",
                        product, bound
                    ));
                    return Ok(existing);
                }
                ConflictPolicy::Fail => {
                    return Err(EupsError::VersionConflict {
                        product: String::from(product.name()),
                        first: bound.version().to_string(),
                        second: product.version().to_string(),
                    })
                }
            }
        }

        let dependencies = self.tables.dependencies(&product)?;
        let index = graph.add(product, optional, depth);

        for dependency in dependencies {
            if let Some(max_depth) = self.max_depth {
                if depth + 1 > max_depth {
                    continue;
                }
            }

            match self.source.lookup(&dependency.name, dependency.version_expr.as_deref())? {
                Some(resolved) => {
                    let child =
                        self.visit(resolved, depth + 1, !dependency.is_required(), graph, sink)?;
                    graph.graph.add_edge(index, child, ());
                }
                None => {
                    let requested = dependency
                        .version_expr
                        .clone()
                        .unwrap_or_else(|| String::from("any"));
                    if dependency.is_required() {
                        return Err(EupsError::product_not_found(
                            &dependency.name,
                            &requested,
                            &self.source.flavor_name(),
                        ));
                    }
                    sink.warn(&format!(
                        "Skipping optional dependency {} {} which is not declared",
                        dependency.name, requested
                    ));
                }
            }
        }

        Ok(index)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use crate::report::LogSink;

    use super::*;

    fn product(name: &str, version: &str) -> Product {
        Product::new(name, version, "Linux", "/eups/db")
    }

    /// Dependency tables declared inline: name → directives.
    struct StubTables {
        tables: HashMap<&'static str, Vec<Dependency>>,
    }

    impl StubTables {
        fn new(tables: Vec<(&'static str, Vec<Dependency>)>) -> Self {
            StubTables {
                tables: tables.into_iter().collect(),
            }
        }
    }

    impl TableProvider for StubTables {
        fn dependencies(&self, product: &Product) -> Result<Vec<Dependency>, EupsError> {
            Ok(self.tables.get(product.name()).cloned().unwrap_or_default())
        }
    }

    /// A fixed set of declared products, one version each.
    struct StubSource {
        products: HashMap<String, Product>,
    }

    impl StubSource {
        fn new(products: Vec<Product>) -> Self {
            StubSource {
                products: products
                    .into_iter()
                    .map(|p| (String::from(p.name()), p))
                    .collect(),
            }
        }
    }

    impl ProductSource for StubSource {
        fn lookup(&self, name: &str, _version_expr: Option<&str>) -> Result<Option<Product>, EupsError> {
            Ok(self.products.get(name).cloned())
        }

        fn flavor_name(&self) -> String {
            String::from("Linux")
        }
    }

    fn names_in_order(graph: &DependencyGraph) -> Vec<String> {
        graph.nodes().map(|node| String::from(node.product.name())).collect()
    }

    #[test]
    fn linear_chain_is_resolved_depth_first() {
        let source = StubSource::new(vec![product("b", "1"), product("c", "1")]);
        let tables = StubTables::new(vec![
            ("a", vec![Dependency::required("b", None)]),
            ("b", vec![Dependency::required("c", None)]),
        ]);

        let graph = Resolver::new(&source, &tables)
            .resolve(product("a", "1"), &LogSink::default())
            .unwrap();

        assert_eq!(names_in_order(&graph), vec!["a", "b", "c"]);
        let depths: Vec<u32> = graph.nodes().map(|node| node.depth).collect();
        assert_eq!(depths, vec![0, 1, 2]);
    }

    #[test]
    fn shared_dependency_is_visited_once() {
        let source = StubSource::new(vec![product("b", "1"), product("c", "1"), product("d", "1")]);
        let tables = StubTables::new(vec![
            ("a", vec![Dependency::required("b", None), Dependency::required("c", None)]),
            ("b", vec![Dependency::required("d", None)]),
            ("c", vec![Dependency::required("d", None)]),
        ]);

        let graph = Resolver::new(&source, &tables)
            .resolve(product("a", "1"), &LogSink::default())
            .unwrap();

        assert_eq!(graph.node_count(), 4);
        assert_eq!(graph.graph().edge_count(), 4);
    }

    #[test]
    fn unresolved_required_dependency_fails() {
        let source = StubSource::new(vec![]);
        let tables = StubTables::new(vec![(
            "a",
            vec![Dependency::required("missing", Some(String::from(">= 2")))],
        )]);

        let err = Resolver::new(&source, &tables)
            .resolve(product("a", "1"), &LogSink::default())
            .unwrap_err();
        assert!(
            matches!(err, EupsError::ProductNotFound { product, requested, .. }
                if product == "missing" && requested == ">= 2")
        );
    }

    #[test]
    fn unresolved_optional_dependency_is_skipped() {
        let source = StubSource::new(vec![product("b", "1")]);
        let tables = StubTables::new(vec![(
            "a",
            vec![
                Dependency::optional("missing", None),
                Dependency::required("b", None),
            ],
        )]);

        let graph = Resolver::new(&source, &tables)
            .resolve(product("a", "1"), &LogSink::default())
            .unwrap();
        assert_eq!(names_in_order(&graph), vec!["a", "b"]);
    }

    #[test]
    fn optional_flag_is_recorded_on_the_node() {
        let source = StubSource::new(vec![product("b", "1")]);
        let tables = StubTables::new(vec![("a", vec![Dependency::optional("b", None)])]);

        let graph = Resolver::new(&source, &tables)
            .resolve(product("a", "1"), &LogSink::default())
            .unwrap();
        let optionals: Vec<bool> = graph.nodes().map(|node| node.optional).collect();
        assert_eq!(optionals, vec![false, true]);
    }

    #[test]
    fn version_conflict_keeps_the_first_binding_by_default() {
        // b was resolved at 1; c demands b at 2.
        struct TwoVersionSource;
        impl ProductSource for TwoVersionSource {
            fn lookup(&self, name: &str, version_expr: Option<&str>) -> Result<Option<Product>, EupsError> {
                match (name, version_expr) {
                    ("b", Some("2")) => Ok(Some(product("b", "2"))),
                    ("b", _) => Ok(Some(product("b", "1"))),
                    ("c", _) => Ok(Some(product("c", "1"))),
                    _ => Ok(None),
                }
            }

            fn flavor_name(&self) -> String {
                String::from("Linux")
            }
        }

        let tables = StubTables::new(vec![
            (
                "a",
                vec![Dependency::required("b", None), Dependency::required("c", None)],
            ),
            ("c", vec![Dependency::required("b", Some(String::from("2")))]),
        ]);

        let graph = Resolver::new(&TwoVersionSource, &tables)
            .resolve(product("a", "1"), &LogSink::default())
            .unwrap();
        assert!(graph.contains("b", "1", "Linux"));
        assert!(!graph.contains("b", "2", "Linux"));

        let strict = Resolver::new(&TwoVersionSource, &tables)
            .with_conflict_policy(ConflictPolicy::Fail)
            .resolve(product("a", "1"), &LogSink::default());
        assert!(matches!(
            strict.unwrap_err(),
            EupsError::VersionConflict { product, .. } if product == "b"
        ));
    }

    #[test]
    fn max_depth_discards_deeper_edges() {
        let source = StubSource::new(vec![product("b", "1"), product("c", "1")]);
        let tables = StubTables::new(vec![
            ("a", vec![Dependency::required("b", None)]),
            ("b", vec![Dependency::required("c", None)]),
        ]);

        let graph = Resolver::new(&source, &tables)
            .with_max_depth(1)
            .resolve(product("a", "1"), &LogSink::default())
            .unwrap();
        assert_eq!(names_in_order(&graph), vec!["a", "b"]);
    }

    #[test]
    fn optional_miss_is_reported_to_the_sink() {
        use crate::report::MockWarningSink;

        let mut sink = MockWarningSink::new();
        sink.expect_warn()
            .withf(|message: &str| message.contains("optional dependency goober"))
            .times(1)
            .return_const(());

        let source = StubSource::new(vec![]);
        let tables = StubTables::new(vec![("a", vec![Dependency::optional("goober", None)])]);

        let graph = Resolver::new(&source, &tables)
            .resolve(product("a", "1"), &sink)
            .unwrap();
        assert_eq!(graph.node_count(), 1);
    }

    #[test]
    fn mocked_table_provider_drives_the_traversal() {
        let mut tables = MockTableProvider::new();
        tables.expect_dependencies().returning(|product| {
            if product.name() == "a" {
                Ok(vec![Dependency::required("b", None)])
            } else {
                Ok(Vec::new())
            }
        });

        let source = StubSource::new(vec![product("b", "1")]);
        let graph = Resolver::new(&source, &tables)
            .resolve(product("a", "1"), &LogSink::default())
            .unwrap();
        assert_eq!(graph.node_count(), 2);
    }
}
