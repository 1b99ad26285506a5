use std::cell::Cell;
use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process;
use std::time::SystemTime;

use eups_man_lib::error::EupsError;
use eups_man_lib::flavor::Flavor;
use eups_man_lib::version::Version;
use log::warn;

use crate::data::{is_real_filename, Product};

const VERSION_SUFFIX: &str = ".version";
const CHAIN_SUFFIX: &str = ".chain";
const NO_FILE: &str = "none";

pub const FLAVOR_KEY: &str = "FLAVOR";
pub const VERSION_KEY: &str = "VERSION";
pub const PROD_DIR_KEY: &str = "PROD_DIR";
pub const TABLE_FILE_KEY: &str = "TABLE_FILE";
pub const PRODUCT_KEY: &str = "PRODUCT";

/// Write `contents` to `path` atomically: stage into a temp file in the
/// same directory, then rename over the target.
pub(crate) fn atomic_write(path: &Path, contents: &str) -> Result<(), EupsError> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent).map_err(|err| EupsError::io(parent, err))?;

    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| String::from("entry"));
    let staging = parent.join(format!(".{}.tmp.{}", file_name, process::id()));

    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&staging)
        .map_err(|err| EupsError::io(&staging, err))?;
    file.write_all(contents.as_bytes())
        .map_err(|err| EupsError::io(&staging, err))?;
    file.sync_all().map_err(|err| EupsError::io(&staging, err))?;
    drop(file);

    fs::rename(&staging, path).map_err(|err| EupsError::io(path, err))
}

/// Split a line-oriented `KEY = value` file into blocks. A new block
/// starts whenever `leader_key` reappears; unknown keys are kept so that
/// foreign attributes survive a rewrite.
pub(crate) fn parse_blocks(contents: &str, leader_key: &str) -> Vec<BTreeMap<String, String>> {
    let mut blocks: Vec<BTreeMap<String, String>> = Vec::new();
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let (key, value) = match line.split_once('=') {
            Some((key, value)) => (key.trim(), value.trim()),
            None => continue,
        };

        if key == leader_key || blocks.is_empty() {
            blocks.push(BTreeMap::new());
        }
        if let Some(block) = blocks.last_mut() {
            block.insert(String::from(key), String::from(value));
        }
    }
    blocks
}

pub(crate) fn render_blocks(blocks: &[BTreeMap<String, String>], key_order: &[&str]) -> String {
    let mut out = String::new();
    for (i, block) in blocks.iter().enumerate() {
        if i > 0 {
            out.push('\n');
        }
        for key in key_order {
            if let Some(value) = block.get(*key) {
                out.push_str(&format!("{} = {}\n", key, value));
            }
        }
        for (key, value) in block {
            if !key_order.contains(&key.as_str()) {
                out.push_str(&format!("{} = {}\n", key, value));
            }
        }
    }
    out
}

/// One product database rooted at a filesystem path. Serializes products
/// to `<db>/<product>/<version>.version` files and tag bindings to
/// `<db>/<product>/<tag>.chain` files.
pub struct ProductStore {
    db: PathBuf,
    writable: Cell<Option<bool>>,
}

impl ProductStore {
    pub fn new<P: Into<PathBuf>>(db: P) -> Self {
        ProductStore {
            db: db.into(),
            writable: Cell::new(None),
        }
    }

    pub fn db(&self) -> &Path {
        &self.db
    }

    /// Whether the database can be updated by the current user, probed
    /// once by creating and removing a staging file.
    pub fn is_writable(&self) -> bool {
        if let Some(writable) = self.writable.get() {
            return writable;
        }
        let probe = self.db.join(format!(".write_probe.{}", process::id()));
        let writable = match OpenOptions::new().write(true).create_new(true).open(&probe) {
            Ok(file) => {
                drop(file);
                let _ = fs::remove_file(&probe);
                true
            }
            Err(_) => false,
        };
        self.writable.set(Some(writable));
        writable
    }

    /// All product names declared in this database, in lexical order.
    pub fn product_names(&self) -> Vec<String> {
        let entries = match fs::read_dir(&self.db) {
            Ok(entries) => entries,
            Err(_) => return Vec::new(),
        };

        let mut names: Vec<String> = entries
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.path().is_dir())
            .filter_map(|entry| entry.file_name().into_string().ok())
            .filter(|name| !name.starts_with('.'))
            .collect();
        names.sort();
        names
    }

    /// The declared versions of a product, from its version files.
    pub fn versions_of(&self, product: &str) -> Vec<String> {
        let mut versions = self.files_with_suffix(product, VERSION_SUFFIX);
        versions.sort();
        versions
    }

    /// The tags with a chain file under this product.
    pub fn chain_tags(&self, product: &str) -> Vec<String> {
        let mut tags = self.files_with_suffix(product, CHAIN_SUFFIX);
        tags.sort();
        tags
    }

    fn files_with_suffix(&self, product: &str, suffix: &str) -> Vec<String> {
        let dir = self.db.join(product);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(_) => return Vec::new(),
        };

        entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| entry.file_name().into_string().ok())
            .filter_map(|name| name.strip_suffix(suffix).map(String::from))
            .filter(|name| !name.starts_with('.'))
            .collect()
    }

    fn version_file(&self, product: &str, version: &str) -> PathBuf {
        self.db.join(product).join(format!("{}{}", version, VERSION_SUFFIX))
    }

    fn chain_file(&self, product: &str, tag: &str) -> PathBuf {
        self.db.join(product).join(format!("{}{}", tag, CHAIN_SUFFIX))
    }

    fn read_tolerant(&self, path: &Path) -> Option<String> {
        match fs::read_to_string(path) {
            Ok(contents) => Some(contents),
            Err(err) if err.kind() == io::ErrorKind::NotFound => None,
            Err(err) => {
                // A file that vanished or cannot be decoded is treated as
                // absent; the product is simply not visible here.
                warn!("Ignoring unreadable file {}: {}", path.display(), err);
                None
            }
        }
    }

    /// All flavor declarations recorded for (product, version).
    pub fn read_version_blocks(&self, product: &str, version: &str) -> Vec<Product> {
        let path = self.version_file(product, version);
        let contents = match self.read_tolerant(&path) {
            Some(contents) => contents,
            None => return Vec::new(),
        };

        parse_blocks(&contents, FLAVOR_KEY)
            .into_iter()
            .filter_map(|block| {
                let flavor = match block.get(FLAVOR_KEY) {
                    Some(flavor) => Flavor::new(flavor.as_str()),
                    None => {
                        warn!("Skipping truncated declaration in {}", path.display());
                        return None;
                    }
                };
                let mut product = Product::new(product, version, flavor, self.db.clone());
                if let Some(dir) = block.get(PROD_DIR_KEY).filter(|d| is_real_filename(d)) {
                    product.set_dir(Some(PathBuf::from(dir)));
                }
                if let Some(table) = block.get(TABLE_FILE_KEY).filter(|t| is_real_filename(t)) {
                    product.set_table_file(Some(PathBuf::from(table)));
                }
                Some(product)
            })
            .collect()
    }

    /// Read the declaration of (product, version) for one exact flavor.
    pub fn read_product(&self, product: &str, version: &str, flavor: &Flavor) -> Option<Product> {
        self.read_version_blocks(product, version)
            .into_iter()
            .find(|p| p.flavor() == flavor)
    }

    /// Insert or replace the flavor block of a product declaration.
    pub fn write_product(&self, product: &Product) -> Result<(), EupsError> {
        let path = self.version_file(product.name(), product.version().as_str());
        let contents = self.read_tolerant(&path).unwrap_or_default();
        let mut blocks = parse_blocks(&contents, FLAVOR_KEY);

        let mut block = BTreeMap::new();
        block.insert(String::from(FLAVOR_KEY), product.flavor().to_string());
        block.insert(String::from(VERSION_KEY), product.version().to_string());
        block.insert(
            String::from(PROD_DIR_KEY),
            product
                .dir()
                .map(|d| d.to_string_lossy().to_string())
                .unwrap_or_else(|| String::from(NO_FILE)),
        );
        block.insert(
            String::from(TABLE_FILE_KEY),
            product
                .table_file()
                .map(|t| t.to_string_lossy().to_string())
                .unwrap_or_else(|| String::from(NO_FILE)),
        );

        match blocks
            .iter_mut()
            .find(|existing| existing.get(FLAVOR_KEY).map(String::as_str) == Some(product.flavor().as_str()))
        {
            Some(existing) => *existing = block,
            None => blocks.push(block),
        }

        atomic_write(
            &path,
            &render_blocks(&blocks, &[FLAVOR_KEY, VERSION_KEY, PROD_DIR_KEY, TABLE_FILE_KEY]),
        )
    }

    /// Remove the flavor block of a declaration. Deletes the version file
    /// when its last block goes, and the product directory when it holds
    /// no further declarations or chains.
    pub fn remove_product(&self, product: &str, version: &str, flavor: &Flavor) -> Result<bool, EupsError> {
        let path = self.version_file(product, version);
        let contents = match self.read_tolerant(&path) {
            Some(contents) => contents,
            None => return Ok(false),
        };

        let mut blocks = parse_blocks(&contents, FLAVOR_KEY);
        let before = blocks.len();
        blocks.retain(|block| block.get(FLAVOR_KEY).map(String::as_str) != Some(flavor.as_str()));
        if blocks.len() == before {
            return Ok(false);
        }

        if blocks.is_empty() {
            fs::remove_file(&path).map_err(|err| EupsError::io(&path, err))?;
            self.remove_product_dir_if_empty(product)?;
        } else {
            atomic_write(
                &path,
                &render_blocks(&blocks, &[FLAVOR_KEY, VERSION_KEY, PROD_DIR_KEY, TABLE_FILE_KEY]),
            )?;
        }
        Ok(true)
    }

    /// The flavor-scoped entries of a tag binding.
    pub fn read_chain(&self, product: &str, tag: &str) -> Vec<(Flavor, Version)> {
        let path = self.chain_file(product, tag);
        let contents = match self.read_tolerant(&path) {
            Some(contents) => contents,
            None => return Vec::new(),
        };

        parse_blocks(&contents, FLAVOR_KEY)
            .into_iter()
            .filter_map(|block| {
                let flavor = block.get(FLAVOR_KEY)?;
                let version = block.get(VERSION_KEY)?;
                Some((Flavor::new(flavor.as_str()), Version::new(version.as_str())))
            })
            .collect()
    }

    /// Bind (flavor → version) under a tag, atomically replacing any
    /// previous entry for the same flavor.
    pub fn write_chain_entry(
        &self,
        product: &str,
        tag: &str,
        flavor: &Flavor,
        version: &Version,
    ) -> Result<(), EupsError> {
        let path = self.chain_file(product, tag);
        let contents = self.read_tolerant(&path).unwrap_or_default();
        let mut blocks = parse_blocks(&contents, FLAVOR_KEY);

        let mut block = BTreeMap::new();
        block.insert(String::from(FLAVOR_KEY), flavor.to_string());
        block.insert(String::from(VERSION_KEY), version.to_string());

        match blocks
            .iter_mut()
            .find(|existing| existing.get(FLAVOR_KEY).map(String::as_str) == Some(flavor.as_str()))
        {
            Some(existing) => *existing = block,
            None => blocks.push(block),
        }

        atomic_write(&path, &render_blocks(&blocks, &[FLAVOR_KEY, VERSION_KEY]))
    }

    /// Drop the entry of one flavor from a chain file; the file itself is
    /// deleted with its last entry.
    pub fn remove_chain_entry(&self, product: &str, tag: &str, flavor: &Flavor) -> Result<bool, EupsError> {
        let path = self.chain_file(product, tag);
        let contents = match self.read_tolerant(&path) {
            Some(contents) => contents,
            None => return Ok(false),
        };

        let mut blocks = parse_blocks(&contents, FLAVOR_KEY);
        let before = blocks.len();
        blocks.retain(|block| block.get(FLAVOR_KEY).map(String::as_str) != Some(flavor.as_str()));
        if blocks.len() == before {
            return Ok(false);
        }

        if blocks.is_empty() {
            fs::remove_file(&path).map_err(|err| EupsError::io(&path, err))?;
            self.remove_product_dir_if_empty(product)?;
        } else {
            atomic_write(&path, &render_blocks(&blocks, &[FLAVOR_KEY, VERSION_KEY]))?;
        }
        Ok(true)
    }

    fn remove_product_dir_if_empty(&self, product: &str) -> Result<(), EupsError> {
        let dir = self.db.join(product);
        let empty = match fs::read_dir(&dir) {
            Ok(mut entries) => entries.next().is_none(),
            Err(_) => return Ok(()),
        };
        if empty {
            fs::remove_dir(&dir).map_err(|err| EupsError::io(&dir, err))?;
        }
        Ok(())
    }

    /// The most recent modification time of any product directory,
    /// used by the cache invalidation rule.
    pub fn newest_dir_mtime(&self) -> Option<SystemTime> {
        self.product_names()
            .into_iter()
            .filter_map(|name| fs::metadata(self.db.join(name)).ok())
            .filter_map(|metadata| metadata.modified().ok())
            .max()
    }
}

#[cfg(test)]
mod tests {
    use assert_fs::prelude::{PathAssert, PathChild};
    use assert_fs::TempDir;
    use predicates::prelude::*;

    use super::*;

    fn store_in(tmp_dir: &TempDir) -> ProductStore {
        ProductStore::new(tmp_dir.path().join("ups_db"))
    }

    fn declared_python(store: &ProductStore, version: &str, flavor: &str) -> Product {
        Product::new("python", version, flavor, store.db())
            .with_dir(Some(PathBuf::from(format!("/opt/python/{}", version))))
            .with_table_file(Some(store.db().join("python/python.table")))
    }

    #[test]
    fn declare_and_read_round_trip() {
        let tmp_dir = TempDir::new().unwrap();
        let store = store_in(&tmp_dir);
        let product = declared_python(&store, "2.5.2", "Linux");

        store.write_product(&product).unwrap();
        tmp_dir
            .child("ups_db/python/2.5.2.version")
            .assert(predicate::path::exists());

        let read_back = store
            .read_product("python", "2.5.2", &Flavor::new("Linux"))
            .unwrap();
        assert_eq!(read_back.dir(), product.dir());
        assert_eq!(read_back.table_file(), product.table_file());

        tmp_dir.close().unwrap();
    }

    #[test]
    fn version_file_holds_one_block_per_flavor() {
        let tmp_dir = TempDir::new().unwrap();
        let store = store_in(&tmp_dir);

        store.write_product(&declared_python(&store, "2.5.2", "Linux")).unwrap();
        store
            .write_product(&declared_python(&store, "2.5.2", "Linux64"))
            .unwrap();

        let blocks = store.read_version_blocks("python", "2.5.2");
        assert_eq!(blocks.len(), 2);
        assert!(store.read_product("python", "2.5.2", &Flavor::new("Linux64")).is_some());

        tmp_dir.close().unwrap();
    }

    #[test]
    fn rewriting_a_flavor_block_replaces_it() {
        let tmp_dir = TempDir::new().unwrap();
        let store = store_in(&tmp_dir);

        store.write_product(&declared_python(&store, "2.5.2", "Linux")).unwrap();
        let relocated = Product::new("python", "2.5.2", "Linux", store.db())
            .with_dir(Some(PathBuf::from("/srv/python/2.5.2")));
        store.write_product(&relocated).unwrap();

        let blocks = store.read_version_blocks("python", "2.5.2");
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].dir(), Some(Path::new("/srv/python/2.5.2")));
        assert_eq!(blocks[0].table_file(), None);

        tmp_dir.close().unwrap();
    }

    #[test]
    fn placeholder_dir_round_trips_as_absent() {
        let tmp_dir = TempDir::new().unwrap();
        let store = store_in(&tmp_dir);

        let product = Product::new("newprod", "1.0", "Linux", store.db());
        store.write_product(&product).unwrap();

        let read_back = store.read_product("newprod", "1.0", &Flavor::new("Linux")).unwrap();
        assert_eq!(read_back.dir(), None);
        assert_eq!(read_back.table_file(), None);

        tmp_dir.close().unwrap();
    }

    #[test]
    fn removing_the_last_flavor_deletes_file_and_dir() {
        let tmp_dir = TempDir::new().unwrap();
        let store = store_in(&tmp_dir);

        store.write_product(&declared_python(&store, "2.5.2", "Linux")).unwrap();
        let removed = store
            .remove_product("python", "2.5.2", &Flavor::new("Linux"))
            .unwrap();
        assert!(removed);

        tmp_dir
            .child("ups_db/python/2.5.2.version")
            .assert(predicate::path::missing());
        tmp_dir.child("ups_db/python").assert(predicate::path::missing());

        tmp_dir.close().unwrap();
    }

    #[test]
    fn removing_an_absent_flavor_is_a_no_op() {
        let tmp_dir = TempDir::new().unwrap();
        let store = store_in(&tmp_dir);

        store.write_product(&declared_python(&store, "2.5.2", "Linux")).unwrap();
        let removed = store
            .remove_product("python", "2.5.2", &Flavor::new("Darwin"))
            .unwrap();
        assert!(!removed);

        tmp_dir.close().unwrap();
    }

    #[test]
    fn chain_entries_replace_per_flavor() {
        let tmp_dir = TempDir::new().unwrap();
        let store = store_in(&tmp_dir);
        store.write_product(&declared_python(&store, "2.6", "Linux")).unwrap();

        store
            .write_chain_entry("python", "beta", &Flavor::new("Linux"), &Version::new("2.6"))
            .unwrap();
        store
            .write_chain_entry("python", "beta", &Flavor::new("Linux"), &Version::new("2.5.2"))
            .unwrap();

        let chain = store.read_chain("python", "beta");
        assert_eq!(chain, vec![(Flavor::new("Linux"), Version::new("2.5.2"))]);

        tmp_dir.close().unwrap();
    }

    #[test]
    fn last_chain_entry_removal_deletes_the_file() {
        let tmp_dir = TempDir::new().unwrap();
        let store = store_in(&tmp_dir);
        store.write_product(&declared_python(&store, "2.6", "Linux")).unwrap();

        store
            .write_chain_entry("python", "beta", &Flavor::new("Linux"), &Version::new("2.6"))
            .unwrap();
        tmp_dir
            .child("ups_db/python/beta.chain")
            .assert(predicate::path::exists());

        let removed = store
            .remove_chain_entry("python", "beta", &Flavor::new("Linux"))
            .unwrap();
        assert!(removed);
        tmp_dir
            .child("ups_db/python/beta.chain")
            .assert(predicate::path::missing());

        tmp_dir.close().unwrap();
    }

    #[test]
    fn truncated_version_file_reads_as_absent() {
        let tmp_dir = TempDir::new().unwrap();
        let store = store_in(&tmp_dir);

        fs::create_dir_all(store.db().join("python")).unwrap();
        fs::write(store.db().join("python/2.5.2.version"), "PROD_DIR = /opt\n").unwrap();

        assert!(store.read_version_blocks("python", "2.5.2").is_empty());

        tmp_dir.close().unwrap();
    }

    #[test]
    fn product_names_skip_hidden_entries() {
        let tmp_dir = TempDir::new().unwrap();
        let store = store_in(&tmp_dir);

        store.write_product(&declared_python(&store, "2.5.2", "Linux")).unwrap();
        fs::create_dir_all(store.db().join(".cache_dir")).unwrap();

        assert_eq!(store.product_names(), vec![String::from("python")]);

        tmp_dir.close().unwrap();
    }

    #[test]
    fn missing_db_yields_no_products() {
        let store = ProductStore::new("/does/not/exist");
        assert!(store.product_names().is_empty());
        assert!(store.newest_dir_mtime().is_none());
    }

    #[test]
    fn writability_probe() {
        let tmp_dir = TempDir::new().unwrap();
        let store = store_in(&tmp_dir);
        fs::create_dir_all(store.db()).unwrap();
        assert!(store.is_writable());

        let missing = ProductStore::new(tmp_dir.path().join("absent"));
        assert!(!missing.is_writable());

        tmp_dir.close().unwrap();
    }
}
