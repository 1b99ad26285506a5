use std::path::{Path, PathBuf};

use eups_man_lib::error::EupsError;
use eups_man_lib::flavor::Flavor;
use eups_man_lib::tag::Tag;
use eups_man_lib::version::Version;
use glob::Pattern;
use itertools::Itertools;
use log::warn;

use crate::cache::DbCache;
use crate::data::Product;
use crate::env::EnvContext;
use crate::lock::{FileLock, DEFAULT_LOCK_TIMEOUT};
use crate::path::PathConfiguration;
use crate::report::WarningSink;
use crate::store::ProductStore;

/// One database root plus its cached view. All mutations go through here
/// so that the disk store and the cache stay in step (write-through) and
/// run under the database lock.
pub struct StackRoot {
    store: ProductStore,
    cache: DbCache,
}

impl StackRoot {
    pub fn open(
        db: PathBuf,
        paths: &dyn PathConfiguration,
        user_data: &Path,
        sink: &dyn WarningSink,
    ) -> Self {
        let store = ProductStore::new(db);
        let cache = DbCache::open(&store, paths, user_data, sink);
        StackRoot { store, cache }
    }

    pub fn db(&self) -> &Path {
        self.store.db()
    }

    pub fn store(&self) -> &ProductStore {
        &self.store
    }

    pub fn cache(&self) -> &DbCache {
        &self.cache
    }

    pub fn is_writable(&self) -> bool {
        self.store.is_writable()
    }

    fn write_lock(&self, paths: &dyn PathConfiguration) -> Result<FileLock, EupsError> {
        FileLock::exclusive(&paths.db_lock_file(self.store.db()), DEFAULT_LOCK_TIMEOUT)
    }

    pub fn declare(
        &mut self,
        product: &Product,
        paths: &dyn PathConfiguration,
        sink: &dyn WarningSink,
    ) -> Result<(), EupsError> {
        let _lock = self.write_lock(paths)?;
        self.store.write_product(product)?;
        self.cache.insert_product(product.clone(), paths, sink);
        Ok(())
    }

    /// Remove one (version, flavor) declaration, cascading the removal of
    /// any tag bindings pointing at it.
    pub fn undeclare(
        &mut self,
        name: &str,
        version: &Version,
        flavor: &Flavor,
        paths: &dyn PathConfiguration,
        sink: &dyn WarningSink,
    ) -> Result<bool, EupsError> {
        let _lock = self.write_lock(paths)?;

        for tag in self.store.chain_tags(name) {
            let bound = self
                .store
                .read_chain(name, &tag)
                .into_iter()
                .any(|(chain_flavor, chain_version)| {
                    chain_flavor == *flavor && chain_version == *version
                });
            if bound {
                self.store.remove_chain_entry(name, &tag, flavor)?;
                self.cache.remove_tag(&Tag::new(tag.as_str()), name, flavor, paths, sink);
            }
        }

        let removed = self.store.remove_product(name, version.as_str(), flavor)?;
        if removed {
            self.cache.remove_product(name, version.as_str(), flavor, paths, sink);
        }
        Ok(removed)
    }

    pub fn assign_tag(
        &mut self,
        tag: &Tag,
        name: &str,
        flavor: &Flavor,
        version: &Version,
        paths: &dyn PathConfiguration,
        sink: &dyn WarningSink,
    ) -> Result<(), EupsError> {
        let _lock = self.write_lock(paths)?;
        self.store.write_chain_entry(name, tag.as_str(), flavor, version)?;
        self.cache.set_tag(tag, name, flavor, version, paths, sink);
        Ok(())
    }

    pub fn unassign_tag(
        &mut self,
        tag: &Tag,
        name: &str,
        flavor: &Flavor,
        paths: &dyn PathConfiguration,
        sink: &dyn WarningSink,
    ) -> Result<bool, EupsError> {
        let _lock = self.write_lock(paths)?;
        let removed = self.store.remove_chain_entry(name, tag.as_str(), flavor)?;
        if removed {
            self.cache.remove_tag(tag, name, flavor, paths, sink);
        }
        Ok(removed)
    }
}

/// An ordered list of product databases consulted as one. Reads return
/// the first hit in stack order; writes target the first writable root.
pub struct ProductStack {
    roots: Vec<StackRoot>,
}

impl ProductStack {
    pub fn new(
        dbs: Vec<PathBuf>,
        paths: &dyn PathConfiguration,
        user_data: &Path,
        sink: &dyn WarningSink,
    ) -> Self {
        let roots = dbs
            .into_iter()
            .map(|db| StackRoot::open(db, paths, user_data, sink))
            .collect();
        ProductStack { roots }
    }

    pub fn roots(&self) -> &[StackRoot] {
        &self.roots
    }

    pub fn roots_mut(&mut self) -> &mut [StackRoot] {
        &mut self.roots
    }

    pub fn db_paths(&self) -> Vec<&Path> {
        self.roots.iter().map(StackRoot::db).collect()
    }

    pub fn root_for(&self, db: &Path) -> Option<&StackRoot> {
        self.roots.iter().find(|root| root.db() == db)
    }

    pub fn root_for_mut(&mut self, db: &Path) -> Option<&mut StackRoot> {
        self.roots.iter_mut().find(|root| root.db() == db)
    }

    pub fn first_writable(&self) -> Option<&StackRoot> {
        self.roots.iter().find(|root| root.is_writable())
    }

    pub fn first_writable_mut(&mut self) -> Option<&mut StackRoot> {
        self.roots.iter_mut().find(|root| root.is_writable())
    }

    /// Exact lookup: the first declaration of (name, version) in stack
    /// order, preferring earlier flavors of the fallback chain.
    pub fn find_product(&self, name: &str, version: &Version, flavors: &[Flavor]) -> Option<Product> {
        for flavor in flavors {
            for root in &self.roots {
                if let Some(product) = root.cache().product(flavor, name, version.as_str()) {
                    return Some(product.clone());
                }
            }
        }
        None
    }

    /// Every declared version of `name`, deduplicated by identity with
    /// earlier roots shadowing later ones.
    pub fn versions_of(&self, name: &str, flavors: &[Flavor]) -> Vec<Product> {
        let mut products: Vec<Product> = Vec::new();
        for root in &self.roots {
            for flavor in flavors {
                for product in root.cache().products_named(flavor, name) {
                    if !products.iter().any(|known| known.identity() == product.identity()) {
                        products.push(product.clone());
                    }
                }
            }
        }
        products
    }

    /// The highest-comparing declared version of `name` across the stack.
    pub fn newest(&self, name: &str, flavors: &[Flavor]) -> Option<Product> {
        self.versions_of(name, flavors)
            .into_iter()
            .max_by(|a, b| a.version().cmp(b.version()))
    }

    /// Resolve a persisted (global) tag in stack order.
    pub fn tagged_product(&self, tag: &str, name: &str, flavors: &[Flavor]) -> Option<Product> {
        for root in &self.roots {
            for flavor in flavors {
                if let Some(version) = root.cache().tag_version(flavor, tag, name) {
                    if let Some(product) = root.cache().product(flavor, name, version.as_str()) {
                        return Some(product.clone());
                    }
                }
            }
        }
        None
    }

    /// All product names declared anywhere in the stack.
    pub fn product_names(&self) -> Vec<String> {
        self.roots
            .iter()
            .flat_map(|root| root.store().product_names())
            .unique()
            .sorted()
            .collect()
    }

    /// Enumerate products by shell-style name and version patterns, an
    /// optional tag filter, and a flavor list. Matches are deduplicated
    /// by (name, version, flavor) with earlier roots shadowing, and are
    /// returned sorted by name, then by ascending version.
    pub fn find_products(
        &self,
        name_glob: Option<&str>,
        version_glob: Option<&str>,
        tags: Option<&[Tag]>,
        flavors: &[Flavor],
        env: &EnvContext,
    ) -> Vec<Product> {
        let name_pattern = compile_pattern(name_glob.unwrap_or("*"));
        let version_pattern = version_glob.map(compile_pattern);

        let mut matches: Vec<Product> = Vec::new();
        for name in self.product_names() {
            if !name_pattern.matches(&name) {
                continue;
            }
            for product in self.versions_of(&name, flavors) {
                if let Some(pattern) = &version_pattern {
                    if !pattern.matches(product.version().as_str()) {
                        continue;
                    }
                }
                if let Some(tags) = tags {
                    if !self.matches_tag_filter(&product, tags, flavors, env) {
                        continue;
                    }
                }
                matches.push(product);
            }
        }

        matches
            .into_iter()
            .unique_by(|product| {
                let (name, version, flavor) = product.identity();
                (String::from(name), String::from(version), String::from(flavor))
            })
            .sorted_by(|a, b| {
                a.name()
                    .cmp(b.name())
                    .then_with(|| a.version().cmp(b.version()))
            })
            .collect()
    }

    fn matches_tag_filter(
        &self,
        product: &Product,
        tags: &[Tag],
        flavors: &[Flavor],
        env: &EnvContext,
    ) -> bool {
        tags.iter().any(|tag| match tag.as_str() {
            eups_man_lib::tag::NEWEST => self
                .newest(product.name(), flavors)
                .map(|newest| newest.identity() == product.identity())
                .unwrap_or(false),
            eups_man_lib::tag::SETUP => env
                .setup_descriptor(product.name())
                .map(|descriptor| {
                    descriptor.version == *product.version() && descriptor.flavor == *product.flavor()
                })
                .unwrap_or(false),
            _ => product.has_tag(tag),
        })
    }

}

fn compile_pattern(pattern: &str) -> Pattern {
    Pattern::new(pattern).unwrap_or_else(|_| {
        warn!("Treating malformed pattern \"{}\" as a literal name", pattern);
        Pattern::new(&glob::Pattern::escape(pattern)).unwrap()
    })
}
