use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use eups_man_lib::flavor::Flavor;
use eups_man_lib::tag::Tag;
use eups_man_lib::version::Version;
use log::debug;
use serde::{Deserialize, Serialize};

use crate::data::Product;
use crate::lock::FileLock;
use crate::path::PathConfiguration;
use crate::report::WarningSink;
use crate::store::ProductStore;

/// Bumped whenever the persisted layout changes; a mismatch discards the
/// file and forces a rescan.
pub const CACHE_FORMAT: u32 = 1;

const CACHE_LOCK_TIMEOUT: Duration = Duration::from_secs(30);

/// The in-memory index of one flavor of one database: every declared
/// product plus the tag bindings that apply to it.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct FlavorCache {
    format: u32,
    flavor: Flavor,
    newest_mtime_secs: u64,
    products: BTreeMap<String, BTreeMap<String, Product>>,
    tags: BTreeMap<String, BTreeMap<String, Version>>,
}

impl FlavorCache {
    fn empty(flavor: Flavor, newest_mtime_secs: u64) -> Self {
        FlavorCache {
            format: CACHE_FORMAT,
            flavor,
            newest_mtime_secs,
            products: BTreeMap::new(),
            tags: BTreeMap::new(),
        }
    }

    pub fn flavor(&self) -> &Flavor {
        &self.flavor
    }

    pub fn product(&self, name: &str, version: &str) -> Option<&Product> {
        self.products.get(name)?.get(version)
    }

    pub fn products_named(&self, name: &str) -> Vec<&Product> {
        self.products
            .get(name)
            .map(|versions| versions.values().collect())
            .unwrap_or_default()
    }

    pub fn all_products(&self) -> impl Iterator<Item = &Product> {
        self.products.values().flat_map(|versions| versions.values())
    }

    pub fn versions_of(&self, name: &str) -> Vec<Version> {
        self.products
            .get(name)
            .map(|versions| versions.values().map(|p| p.version().clone()).collect())
            .unwrap_or_default()
    }

    pub fn tag_version(&self, tag: &str, name: &str) -> Option<&Version> {
        self.tags.get(tag)?.get(name)
    }

    pub fn tag_names(&self) -> impl Iterator<Item = &str> {
        self.tags.keys().map(String::as_str)
    }

    fn insert_product(&mut self, product: Product) {
        self.products
            .entry(String::from(product.name()))
            .or_default()
            .insert(product.version().to_string(), product);
    }

    fn remove_product(&mut self, name: &str, version: &str) -> Option<Product> {
        let versions = self.products.get_mut(name)?;
        let removed = versions.remove(version);
        if versions.is_empty() {
            self.products.remove(name);
        }
        removed
    }

    fn set_tag(&mut self, tag: &Tag, name: &str, version: &Version) {
        if let Some(previous) = self
            .tags
            .entry(tag.to_string())
            .or_default()
            .insert(String::from(name), version.clone())
        {
            if let Some(product) = self
                .products
                .get_mut(name)
                .and_then(|versions| versions.get_mut(previous.as_str()))
            {
                product.remove_tag(tag);
            }
        }
        if let Some(product) = self
            .products
            .get_mut(name)
            .and_then(|versions| versions.get_mut(version.as_str()))
        {
            product.add_tag(tag.clone());
        }
    }

    fn remove_tag(&mut self, tag: &Tag, name: &str) -> Option<Version> {
        let bindings = self.tags.get_mut(tag.as_str())?;
        let removed = bindings.remove(name);
        if bindings.is_empty() {
            self.tags.remove(tag.as_str());
        }
        if let Some(version) = &removed {
            if let Some(product) = self
                .products
                .get_mut(name)
                .and_then(|versions| versions.get_mut(version.as_str()))
            {
                product.remove_tag(tag);
            }
        }
        removed
    }
}

/// The cached view of one database root: a FlavorCache per flavor found in
/// the store, persisted to `<db>/.cache.<flavor>` files (or to a mirror in
/// the user data directory when the database is not writable).
pub struct DbCache {
    db: PathBuf,
    cache_dir: PathBuf,
    writable: bool,
    flavors: HashMap<Flavor, FlavorCache>,
}

impl DbCache {
    pub fn open(
        store: &ProductStore,
        paths: &dyn PathConfiguration,
        user_data: &Path,
        sink: &dyn WarningSink,
    ) -> Self {
        let writable = store.is_writable();
        let cache_dir = if writable {
            store.db().to_path_buf()
        } else {
            paths.user_cache_dir(user_data, store.db())
        };

        let newest = mtime_secs(store.newest_dir_mtime());
        let mut cache = DbCache {
            db: store.db().to_path_buf(),
            cache_dir,
            writable,
            flavors: HashMap::new(),
        };

        if let Some(flavors) = cache.load_fresh(paths, newest, sink) {
            debug!("Loaded product cache for {} without a rescan", cache.db.display());
            cache.flavors = flavors;
        } else {
            cache.flavors = scan(store, newest, sink);
            cache.persist_all(paths, sink);
        }
        cache
    }

    /// Load the persisted caches if every file is present with the right
    /// format and none is older than the newest product directory.
    fn load_fresh(
        &self,
        paths: &dyn PathConfiguration,
        newest: u64,
        sink: &dyn WarningSink,
    ) -> Option<HashMap<Flavor, FlavorCache>> {
        let entries = fs::read_dir(&self.cache_dir).ok()?;
        let cache_files: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| {
                path.file_name()
                    .map(|name| name.to_string_lossy().starts_with(".cache."))
                    .unwrap_or(false)
                    && !path.to_string_lossy().ends_with(".lock")
            })
            .collect();
        if cache_files.is_empty() {
            return None;
        }

        let lock_path = paths.cache_lock_file(&self.cache_dir);
        let _lock = match FileLock::shared(&lock_path, CACHE_LOCK_TIMEOUT) {
            Ok(lock) => lock,
            Err(err) => {
                sink.warn(&format!(
                    "Could not take a read lock on the product cache ({}), rescanning",
                    err
                ));
                return None;
            }
        };

        let mut flavors = HashMap::new();
        for path in cache_files {
            let contents = fs::read_to_string(&path).ok()?;
            let cache: FlavorCache = serde_json::from_str(&contents).ok()?;
            if cache.format != CACHE_FORMAT {
                sink.note(&format!(
                    "Discarding product cache {} with format {}",
                    path.display(),
                    cache.format
                ));
                return None;
            }
            if newest > cache.newest_mtime_secs {
                return None;
            }
            flavors.insert(cache.flavor.clone(), cache);
        }
        Some(flavors)
    }

    fn persist_all(&self, paths: &dyn PathConfiguration, sink: &dyn WarningSink) {
        for flavor in self.flavors.keys() {
            self.persist_flavor(paths, flavor, sink);
        }
    }

    /// Write one flavor's cache file under an exclusive lock. A lock that
    /// cannot be taken in time degrades to a memory-only cache.
    pub fn persist_flavor(&self, paths: &dyn PathConfiguration, flavor: &Flavor, sink: &dyn WarningSink) {
        let cache = match self.flavors.get(flavor) {
            Some(cache) => cache,
            None => return,
        };

        if fs::create_dir_all(&self.cache_dir).is_err() {
            sink.warn(&format!(
                "Cannot create cache directory {}, keeping cache in memory",
                self.cache_dir.display()
            ));
            return;
        }

        let lock_path = paths.cache_lock_file(&self.cache_dir);
        let _lock = match FileLock::exclusive(&lock_path, CACHE_LOCK_TIMEOUT) {
            Ok(lock) => lock,
            Err(err) => {
                sink.warn(&format!(
                    "Could not take a write lock on the product cache ({}), keeping cache in memory",
                    err
                ));
                return;
            }
        };

        let path = paths.cache_file(&self.cache_dir, flavor.as_str());
        let contents = match serde_json::to_string_pretty(cache) {
            Ok(contents) => contents,
            Err(err) => {
                sink.warn(&format!("Could not serialize the product cache: {}", err));
                return;
            }
        };
        if let Err(err) = crate::store::atomic_write(&path, &contents) {
            sink.warn(&format!("Could not write {}: {}", path.display(), err));
        }
    }

    pub fn db(&self) -> &Path {
        &self.db
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }

    pub fn flavors(&self) -> Vec<&Flavor> {
        self.flavors.keys().collect()
    }

    pub fn flavor_cache(&self, flavor: &Flavor) -> Option<&FlavorCache> {
        self.flavors.get(flavor)
    }

    pub fn product(&self, flavor: &Flavor, name: &str, version: &str) -> Option<&Product> {
        self.flavors.get(flavor)?.product(name, version)
    }

    pub fn products_named(&self, flavor: &Flavor, name: &str) -> Vec<&Product> {
        self.flavors
            .get(flavor)
            .map(|cache| cache.products_named(name))
            .unwrap_or_default()
    }

    pub fn tag_version(&self, flavor: &Flavor, tag: &str, name: &str) -> Option<&Version> {
        self.flavors.get(flavor)?.tag_version(tag, name)
    }

    /// Every persisted tag name visible in this database.
    pub fn tag_names(&self) -> BTreeSet<String> {
        self.flavors
            .values()
            .flat_map(|cache| cache.tag_names().map(String::from))
            .collect()
    }

    fn touch(&mut self) {
        let now = mtime_secs(Some(SystemTime::now()));
        for cache in self.flavors.values_mut() {
            cache.newest_mtime_secs = now;
        }
    }

    pub fn insert_product(
        &mut self,
        product: Product,
        paths: &dyn PathConfiguration,
        sink: &dyn WarningSink,
    ) {
        let flavor = product.flavor().clone();
        let newest = mtime_secs(Some(SystemTime::now()));
        self.flavors
            .entry(flavor.clone())
            .or_insert_with(|| FlavorCache::empty(flavor.clone(), newest))
            .insert_product(product);
        self.touch();
        self.persist_flavor(paths, &flavor, sink);
    }

    pub fn remove_product(
        &mut self,
        name: &str,
        version: &str,
        flavor: &Flavor,
        paths: &dyn PathConfiguration,
        sink: &dyn WarningSink,
    ) {
        if let Some(cache) = self.flavors.get_mut(flavor) {
            cache.remove_product(name, version);
        }
        self.touch();
        self.persist_flavor(paths, flavor, sink);
    }

    pub fn set_tag(
        &mut self,
        tag: &Tag,
        name: &str,
        flavor: &Flavor,
        version: &Version,
        paths: &dyn PathConfiguration,
        sink: &dyn WarningSink,
    ) {
        if let Some(cache) = self.flavors.get_mut(flavor) {
            cache.set_tag(tag, name, version);
            self.touch();
            self.persist_flavor(paths, flavor, sink);
        }
    }

    pub fn remove_tag(
        &mut self,
        tag: &Tag,
        name: &str,
        flavor: &Flavor,
        paths: &dyn PathConfiguration,
        sink: &dyn WarningSink,
    ) {
        if let Some(cache) = self.flavors.get_mut(flavor) {
            cache.remove_tag(tag, name);
            self.touch();
            self.persist_flavor(paths, flavor, sink);
        }
    }
}

fn mtime_secs(time: Option<SystemTime>) -> u64 {
    time.and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Full rescan of a store: read every version file and chain file and
/// build one FlavorCache per flavor encountered.
fn scan(store: &ProductStore, newest: u64, sink: &dyn WarningSink) -> HashMap<Flavor, FlavorCache> {
    let mut flavors: HashMap<Flavor, FlavorCache> = HashMap::new();

    for name in store.product_names() {
        for version in store.versions_of(&name) {
            for product in store.read_version_blocks(&name, &version) {
                let flavor = product.flavor().clone();
                flavors
                    .entry(flavor.clone())
                    .or_insert_with(|| FlavorCache::empty(flavor, newest))
                    .insert_product(product);
            }
        }

        for tag in store.chain_tags(&name) {
            for (flavor, version) in store.read_chain(&name, &tag) {
                let cache = flavors
                    .entry(flavor.clone())
                    .or_insert_with(|| FlavorCache::empty(flavor.clone(), newest));
                if cache.product(&name, version.as_str()).is_none() {
                    sink.warn(&format!(
                        "Tag \"{}\" of {} points at undeclared version {} ({}), ignoring",
                        tag, name, version, flavor
                    ));
                    continue;
                }
                cache.set_tag(&Tag::new(tag.as_str()), &name, &version);
            }
        }
    }

    flavors
}
