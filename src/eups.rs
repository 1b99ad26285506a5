use std::path::{Path, PathBuf};

use eups_man_lib::error::EupsError;
use eups_man_lib::flavor::{determine_flavor, FallbackFlavors, Flavor};
use eups_man_lib::tag::Tag;
use eups_man_lib::version::VersionExpr;

use crate::config::{UserConfig, DEFAULT_PREFERRED_TAGS};
use crate::data::Product;
use crate::env::{dir_env_name, EnvContext, SetupDescriptor};
use crate::path::PathConfiguration;
use crate::registry::TagRegistry;
use crate::report::WarningSink;
use crate::resolve::{ConflictPolicy, FileTableProvider, ProductSource, Resolver};
use crate::sort::{sort, OnCycle};
use crate::stack::ProductStack;

/// Conventional tags that are meaningful even before any database binds
/// them, so that they can sit in the preferred list from the start.
const WELL_KNOWN_TAGS: [&str; 2] = ["stable", "current"];

/// The façade over the product database layers: version expressions,
/// flavors, the store/cache/stack, tags, dependency resolution and the
/// topological sorter are all driven from here.
pub struct Eups<'a> {
    paths: &'a dyn PathConfiguration,
    sink: &'a dyn WarningSink,
    env: EnvContext,
    flavor: Flavor,
    fallbacks: FallbackFlavors,
    user_data: PathBuf,
    stack: ProductStack,
    registry: TagRegistry,
    force: bool,
    on_cycle: OnCycle,
    conflicts: ConflictPolicy,
    max_depth: Option<u32>,
}

impl<'a> Eups<'a> {
    /// Build a façade from an environment snapshot: EUPS_PATH supplies
    /// the stack, EUPS_FLAVOR overrides detection and EUPS_USERDATA
    /// relocates the user data directory.
    pub fn new(
        env: EnvContext,
        paths: &'a dyn PathConfiguration,
        sink: &'a dyn WarningSink,
    ) -> Result<Self, EupsError> {
        let flavor = determine_flavor(env.flavor_override())?;
        let user_data = paths.user_data_dir(env.user_data_override());
        if let Err(err) = paths.create_user_dirs(&user_data) {
            sink.warn(&format!("Could not prepare {}: {:#}", user_data.display(), err));
        }

        let config = match UserConfig::read_config(&paths.user_config_file(&user_data)) {
            Ok(config) => config,
            Err(err) => {
                sink.warn(&format!("Ignoring unreadable user config: {:#}", err));
                UserConfig::default()
            }
        };

        let mut dbs = env.eups_path();
        match config.extra_db_paths() {
            Ok(extra) => dbs.extend(extra),
            Err(err) => sink.warn(&format!("Ignoring configured extra db paths: {:#}", err)),
        }

        let stack = ProductStack::new(dbs, paths, &user_data, sink);
        let mut registry = TagRegistry::new(&user_data);
        registry.recognize_from_stack(&stack);
        for tag in WELL_KNOWN_TAGS {
            registry.recognize(tag);
        }

        let preferred: Vec<String> = config
            .preferred_tags()
            .map(|tags| tags.to_vec())
            .unwrap_or_else(|| DEFAULT_PREFERRED_TAGS.clone());
        let preferred: Vec<&str> = preferred.iter().map(String::as_str).collect();
        registry.set_preferred_kindly(&preferred);

        Ok(Eups {
            paths,
            sink,
            fallbacks: config.fallback_flavors(),
            env,
            flavor,
            user_data,
            stack,
            registry,
            force: false,
            on_cycle: OnCycle::default(),
            conflicts: ConflictPolicy::FirstWins,
            max_depth: None,
        })
    }

    pub fn flavor(&self) -> &Flavor {
        &self.flavor
    }

    /// The flavor lookup chain: the primary flavor, its configured
    /// fallbacks, then "Generic".
    pub fn flavors(&self) -> Vec<Flavor> {
        self.fallbacks.chain(&self.flavor)
    }

    pub fn user_data(&self) -> &Path {
        &self.user_data
    }

    pub fn stack(&self) -> &ProductStack {
        &self.stack
    }

    pub fn registry(&self) -> &TagRegistry {
        &self.registry
    }

    pub fn env(&self) -> &EnvContext {
        &self.env
    }

    pub fn set_force(&mut self, force: bool) {
        self.force = force;
    }

    pub fn set_on_cycle(&mut self, on_cycle: OnCycle) {
        self.on_cycle = on_cycle;
    }

    pub fn set_conflict_policy(&mut self, conflicts: ConflictPolicy) {
        self.conflicts = conflicts;
    }

    pub fn set_max_depth(&mut self, max_depth: Option<u32>) {
        self.max_depth = max_depth;
    }

    pub fn preferred_tags(&self) -> &[String] {
        self.registry.preferred()
    }

    pub fn set_preferred_tags(&mut self, tags: &[&str]) -> Result<(), EupsError> {
        self.registry.set_preferred(tags)
    }

    pub fn set_preferred_tags_kindly(&mut self, tags: &[&str]) {
        self.registry.set_preferred_kindly(tags)
    }

    fn products_of(&self, name: &str, dbs: Option<&[PathBuf]>) -> Vec<Product> {
        let products = self.stack.versions_of(name, &self.flavors());
        match dbs {
            Some(dbs) => products
                .into_iter()
                .filter(|product| dbs.iter().any(|db| db.as_path() == product.db()))
                .collect(),
            None => products,
        }
    }

    /// Single best match for a product under the preferred-tag order.
    /// `request` may be a literal version, a relational predicate such as
    /// ">= 2.6", or a recognized tag name; None applies the preferred
    /// tags alone.
    pub fn find_product(&self, name: &str, request: Option<&str>) -> Result<Option<Product>, EupsError> {
        self.find_product_in(name, request, None)
    }

    /// Like `find_product`, restricted to a subset of the stack's
    /// database roots when `dbs` is given.
    pub fn find_product_in(
        &self,
        name: &str,
        request: Option<&str>,
        dbs: Option<&[PathBuf]>,
    ) -> Result<Option<Product>, EupsError> {
        let request = match request {
            Some(request) => request,
            None => return Ok(self.preferred_product(name, dbs)),
        };

        if self.registry.is_recognized(request) {
            return self.find_tagged_product(name, request).map(|found| {
                found.filter(|product| {
                    dbs.map(|dbs| dbs.iter().any(|db| db.as_path() == product.db()))
                        .unwrap_or(true)
                })
            });
        }

        let expr = VersionExpr::parse(request)?;
        let candidates: Vec<Product> = self
            .products_of(name, dbs)
            .into_iter()
            .filter(|product| expr.matches(product.version()))
            .collect();
        Ok(self.best_of(name, candidates))
    }

    /// Resolve a single recognized tag for a product.
    pub fn find_tagged_product(&self, name: &str, tag: &str) -> Result<Option<Product>, EupsError> {
        if !self.registry.is_recognized(tag) {
            return Err(EupsError::TagNotRecognized(String::from(tag)));
        }
        Ok(self
            .registry
            .resolve(tag, name, &self.stack, &self.flavors(), &self.env))
    }

    /// Pick among candidates: the first preferred tag resolving to one of
    /// them wins, else the highest-comparing version.
    fn best_of(&self, name: &str, candidates: Vec<Product>) -> Option<Product> {
        for tag in self.registry.preferred() {
            let resolved = self
                .registry
                .resolve(tag, name, &self.stack, &self.flavors(), &self.env);
            if let Some(resolved) = resolved {
                if let Some(found) = candidates
                    .iter()
                    .find(|candidate| candidate.identity() == resolved.identity())
                {
                    return Some(found.clone());
                }
            }
        }
        candidates.into_iter().max_by(|a, b| a.version().cmp(b.version()))
    }

    fn preferred_product(&self, name: &str, dbs: Option<&[PathBuf]>) -> Option<Product> {
        let candidates = self.products_of(name, dbs);
        if candidates.is_empty() {
            return None;
        }
        self.best_of(name, candidates)
    }

    /// Enumerate products by shell-style patterns. Order: name lexically,
    /// then ascending version. Unknown tag filters are an error.
    pub fn find_products(
        &self,
        name_glob: Option<&str>,
        version_glob: Option<&str>,
        tags: Option<&[&str]>,
        flavors: Option<&[Flavor]>,
    ) -> Result<Vec<Product>, EupsError> {
        let tag_filter = match tags {
            Some(tags) => {
                let mut filter = Vec::with_capacity(tags.len());
                for tag in tags {
                    if !self.registry.is_recognized(tag) {
                        return Err(EupsError::TagNotRecognized(String::from(*tag)));
                    }
                    filter.push(Tag::new(*tag));
                }
                Some(filter)
            }
            None => None,
        };

        let chain = self.flavors();
        let flavors = flavors.unwrap_or(&chain);
        Ok(self.stack.find_products(
            name_glob,
            version_glob,
            tag_filter.as_deref(),
            flavors,
            &self.env,
        ))
    }

    /// Insert or update a product declaration, optionally binding a tag.
    /// Changing the install directory or table file of an existing
    /// declaration requires force.
    pub fn declare(
        &mut self,
        name: &str,
        version: &str,
        product_dir: Option<&Path>,
        db: Option<&Path>,
        table_file: Option<&Path>,
        tag: Option<&str>,
    ) -> Result<(), EupsError> {
        let flavor = self.flavor.clone();
        let force = self.force;

        let root = match db {
            Some(db) => self.stack.root_for_mut(db).ok_or(EupsError::NoWritableDb)?,
            None => self.stack.first_writable_mut().ok_or(EupsError::NoWritableDb)?,
        };
        if !root.is_writable() {
            return Err(EupsError::NoWritableDb);
        }

        // Without a dir or table file this declare only (re)binds a tag
        // on an existing declaration.
        let existing = root.store().read_product(name, version, &flavor);
        let metadata_only = product_dir.is_none() && table_file.is_none();
        match &existing {
            Some(existing) if !metadata_only => {
                let changed = existing.dir() != product_dir || existing.table_file() != table_file;
                if changed && !force {
                    return Err(EupsError::AlreadyDeclared {
                        product: String::from(name),
                        version: String::from(version),
                    });
                }
            }
            None if metadata_only => {
                return Err(EupsError::product_not_found(name, version, flavor.as_str()));
            }
            _ => {}
        }

        if !metadata_only {
            let mut product = Product::new(name, version, flavor.clone(), root.db())
                .with_dir(product_dir.map(Path::to_path_buf))
                .with_table_file(table_file.map(Path::to_path_buf));
            // A forced re-declare rewrites metadata but keeps the tags
            // bound to this version.
            if let Some(cached) = root.cache().product(&flavor, name, version) {
                product.set_tags(cached.tags().to_vec());
            }
            root.declare(&product, self.paths, self.sink)?;
        }

        if let Some(tag) = tag {
            self.assign_tag(tag, name, version)?;
        }
        Ok(())
    }

    /// Remove a product version (cascading its tag bindings), or only a
    /// tag binding when `tag` is given. Without a version, exactly one
    /// declared version must exist.
    pub fn undeclare(
        &mut self,
        name: &str,
        version: Option<&str>,
        db: Option<&Path>,
        tag: Option<&str>,
    ) -> Result<(), EupsError> {
        if let Some(tag) = tag {
            return self.unassign_tag(tag, name, version);
        }

        let dbs = db.map(|db| vec![db.to_path_buf()]);
        let candidates = self.products_of(name, dbs.as_deref());
        if candidates.is_empty() {
            return Err(EupsError::product_not_found(
                name,
                version.unwrap_or("any"),
                self.flavor.as_str(),
            ));
        }

        let target = match version {
            Some(version) => candidates
                .into_iter()
                .find(|candidate| candidate.version().as_str() == version)
                .ok_or_else(|| EupsError::product_not_found(name, version, self.flavor.as_str()))?,
            None => {
                if candidates.len() > 1 {
                    return Err(EupsError::AmbiguousVersion(String::from(name)));
                }
                candidates.into_iter().next().expect("one candidate")
            }
        };

        let root = self
            .stack
            .root_for_mut(target.db())
            .ok_or(EupsError::NoWritableDb)?;
        if !root.is_writable() {
            return Err(EupsError::NoWritableDb);
        }
        root.undeclare(
            name,
            target.version(),
            target.flavor(),
            self.paths,
            self.sink,
        )?;
        Ok(())
    }

    /// Bind a global tag to (name, version) in the first writable root
    /// declaring that product. Rebinding from another version is atomic.
    pub fn assign_tag(&mut self, tag: &str, name: &str, version: &str) -> Result<(), EupsError> {
        let tag = Tag::new(tag);
        if tag.is_pseudo() {
            return Err(EupsError::TagNotRecognized(tag.to_string()));
        }

        let flavors = self.flavors();
        let target = self
            .products_of(name, None)
            .into_iter()
            .find(|product| product.version().as_str() == version)
            .ok_or_else(|| EupsError::product_not_found(name, version, self.flavor.as_str()))?;

        let root = self
            .stack
            .roots()
            .iter()
            .position(|root| {
                root.is_writable()
                    && flavors
                        .iter()
                        .any(|flavor| root.cache().product(flavor, name, version).is_some())
            })
            .ok_or(EupsError::NoWritableDb)?;
        let root = &mut self.stack.roots_mut()[root];

        root.assign_tag(
            &tag,
            name,
            target.flavor(),
            target.version(),
            self.paths,
            self.sink,
        )?;
        self.registry.recognize(tag.as_str());
        Ok(())
    }

    /// Remove a global tag binding. A version that does not match the
    /// current binding is a warning, not an error; a missing product is.
    pub fn unassign_tag(&mut self, tag: &str, name: &str, version: Option<&str>) -> Result<(), EupsError> {
        if self.products_of(name, None).is_empty() {
            return Err(EupsError::product_not_found(
                name,
                version.unwrap_or("any"),
                self.flavor.as_str(),
            ));
        }

        let tag = Tag::new(tag);
        let flavors = self.flavors();
        let binding = self.stack.roots().iter().enumerate().find_map(|(index, root)| {
            flavors.iter().find_map(|flavor| {
                root.cache()
                    .tag_version(flavor, tag.as_str(), name)
                    .map(|bound| (index, flavor.clone(), bound.clone()))
            })
        });

        let (index, flavor, bound) = match binding {
            Some(binding) => binding,
            None => {
                self.sink
                    .warn(&format!("Tag \"{}\" is not assigned to {}", tag, name));
                return Ok(());
            }
        };

        if let Some(version) = version {
            if bound.as_str() != version {
                self.sink.warn(&format!(
                    "Tag \"{}\" of {} is bound to {} not {}, leaving it alone",
                    tag, name, bound, version
                ));
                return Ok(());
            }
        }

        let root = &mut self.stack.roots_mut()[index];
        if !root.is_writable() {
            return Err(EupsError::NoWritableDb);
        }
        root.unassign_tag(&tag, name, &flavor, self.paths, self.sink)?;
        Ok(())
    }

    /// Bind a user-scope tag, stored in the user data directory rather
    /// than the product database.
    pub fn assign_user_tag(&mut self, tag: &str, name: &str, version: &str) -> Result<(), EupsError> {
        let tag = Tag::new(tag);
        if tag.is_pseudo() {
            return Err(EupsError::TagNotRecognized(tag.to_string()));
        }

        let target = self
            .products_of(name, None)
            .into_iter()
            .find(|product| product.version().as_str() == version)
            .ok_or_else(|| EupsError::product_not_found(name, version, self.flavor.as_str()))?;
        self.registry
            .assign_user_tag(&tag, name, target.flavor(), target.version())
    }

    pub fn unassign_user_tag(&mut self, tag: &str, name: &str) -> Result<(), EupsError> {
        if self.products_of(name, None).is_empty() {
            return Err(EupsError::product_not_found(name, "any", self.flavor.as_str()));
        }
        let removed = self.registry.unassign_user_tag(&Tag::new(tag), name)?;
        if !removed {
            self.sink
                .warn(&format!("User tag \"{}\" is not assigned to {}", tag, name));
        }
        Ok(())
    }

    /// Resolve a product and its transitive dependencies, order them, and
    /// record the result in the environment context: <NAME>_DIR for real
    /// install directories and SETUP_<NAME> descriptors for every product.
    /// Returns the products in the order they were applied,
    /// prerequisites first.
    pub fn setup(
        &self,
        name: &str,
        request: Option<&str>,
        ctx: &mut EnvContext,
    ) -> Result<Vec<Product>, EupsError> {
        let root = self.find_product(name, request)?.ok_or_else(|| {
            EupsError::product_not_found(name, request.unwrap_or("any"), self.flavor.as_str())
        })?;

        let tables = FileTableProvider;
        let mut resolver = Resolver::new(self, &tables).with_conflict_policy(self.conflicts);
        if let Some(max_depth) = self.max_depth {
            resolver = resolver.with_max_depth(max_depth);
        }
        let graph = resolver.resolve(root, self.sink)?;
        let layers = sort(graph.graph(), self.on_cycle, self.sink)?;

        let mut applied = Vec::new();
        for layer in layers.iter().rev() {
            for group in layer {
                for product in group.products() {
                    self.apply_setup(product, ctx);
                    applied.push(product.clone());
                }
            }
        }
        Ok(applied)
    }

    fn apply_setup(&self, product: &Product, ctx: &mut EnvContext) {
        if let Some(dir) = product.dir() {
            ctx.set(dir_env_name(product.name()), dir.to_string_lossy());
        }
        let descriptor = SetupDescriptor::new(
            product.name(),
            product.flavor().clone(),
            product.version().clone(),
            product.db().to_path_buf(),
        );
        let var = ctx.setup_env_name(product.name());
        ctx.set(var, descriptor.to_string());
    }

    /// Invert `setup` for one product, recovering what was setup from its
    /// SETUP_<NAME> descriptor.
    pub fn unsetup(&self, name: &str, ctx: &mut EnvContext) -> Result<SetupDescriptor, EupsError> {
        let descriptor = ctx
            .setup_descriptor(name)
            .ok_or_else(|| EupsError::product_not_found(name, "setup", self.flavor.as_str()))?;

        let var = ctx.setup_env_name(name);
        ctx.remove(&var);
        ctx.remove(&dir_env_name(&descriptor.product));
        Ok(descriptor)
    }
}

impl ProductSource for Eups<'_> {
    fn lookup(&self, name: &str, version_expr: Option<&str>) -> Result<Option<Product>, EupsError> {
        self.find_product(name, version_expr)
    }

    fn flavor_name(&self) -> String {
        self.flavor.to_string()
    }
}
