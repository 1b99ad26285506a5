use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use eups_man_lib::error::EupsError;
use eups_man_lib::flavor::Flavor;
use eups_man_lib::tag::{self, Tag};
use eups_man_lib::version::Version;
use log::warn;

use crate::data::Product;
use crate::env::EnvContext;
use crate::stack::ProductStack;
use crate::store::{atomic_write, parse_blocks, render_blocks, FLAVOR_KEY, PRODUCT_KEY, VERSION_KEY};

const CHAIN_SUFFIX: &str = ".chain";

/// The set of recognized tags plus the user-scope bindings kept in the
/// user data directory. Persisted global bindings live in the product
/// databases and are consulted through the stack.
pub struct TagRegistry {
    user_data: PathBuf,
    known: BTreeSet<String>,
    preferred: Vec<String>,
    user_tags: BTreeMap<String, BTreeMap<String, (Flavor, Version)>>,
}

impl TagRegistry {
    /// Build a registry knowing the pseudo-tags and any user-scope tags
    /// found in `user_data`.
    pub fn new(user_data: &Path) -> Self {
        let mut registry = TagRegistry {
            user_data: user_data.to_path_buf(),
            known: tag::pseudo_tags().iter().map(|t| String::from(*t)).collect(),
            preferred: Vec::new(),
            user_tags: BTreeMap::new(),
        };
        registry.load_user_tags();
        registry
    }

    fn load_user_tags(&mut self) {
        let entries = match fs::read_dir(&self.user_data) {
            Ok(entries) => entries,
            Err(_) => return,
        };

        for entry in entries.filter_map(|entry| entry.ok()) {
            let file_name = entry.file_name();
            let name = file_name.to_string_lossy();
            let tag = match name.strip_suffix(CHAIN_SUFFIX) {
                Some(tag) if !tag.starts_with('.') => String::from(tag),
                _ => continue,
            };

            let contents = match fs::read_to_string(entry.path()) {
                Ok(contents) => contents,
                Err(err) => {
                    warn!("Ignoring unreadable user chain {}: {}", entry.path().display(), err);
                    continue;
                }
            };

            let mut bindings = BTreeMap::new();
            for block in parse_blocks(&contents, PRODUCT_KEY) {
                match (block.get(PRODUCT_KEY), block.get(FLAVOR_KEY), block.get(VERSION_KEY)) {
                    (Some(product), Some(flavor), Some(version)) => {
                        bindings.insert(
                            String::from(product.as_str()),
                            (Flavor::new(flavor.as_str()), Version::new(version.as_str())),
                        );
                    }
                    _ => warn!("Skipping truncated entry in {}", entry.path().display()),
                }
            }
            self.recognize(&tag);
            self.user_tags.insert(tag, bindings);
        }
    }

    /// Register the persisted tags visible through a stack's caches.
    pub fn recognize_from_stack(&mut self, stack: &ProductStack) {
        for root in stack.roots() {
            for tag in root.cache().tag_names() {
                self.recognize(&tag);
            }
        }
    }

    pub fn recognize(&mut self, name: &str) {
        self.known.insert(String::from(name));
    }

    pub fn is_recognized(&self, name: &str) -> bool {
        self.known.contains(name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.known.iter().map(String::as_str).collect()
    }

    pub fn preferred(&self) -> &[String] {
        &self.preferred
    }

    /// Set the tag precedence used when a query matches several tagged
    /// candidates. Unknown names are an error.
    pub fn set_preferred(&mut self, tags: &[&str]) -> Result<(), EupsError> {
        for tag in tags {
            if !self.is_recognized(tag) {
                return Err(EupsError::TagNotRecognized(String::from(*tag)));
            }
        }
        self.preferred = tags.iter().map(|t| String::from(*t)).collect();
        Ok(())
    }

    /// Like `set_preferred`, but silently drops unknown names. When
    /// nothing survives the filter the previous order is retained.
    pub fn set_preferred_kindly(&mut self, tags: &[&str]) {
        let survivors: Vec<String> = tags
            .iter()
            .filter(|tag| self.is_recognized(tag))
            .map(|tag| String::from(*tag))
            .collect();
        if !survivors.is_empty() {
            self.preferred = survivors;
        }
    }

    /// Resolve a tag for one product: pseudo-tags first, then the user
    /// scope, then each database in stack order.
    pub fn resolve(
        &self,
        tag: &str,
        name: &str,
        stack: &ProductStack,
        flavors: &[Flavor],
        env: &EnvContext,
    ) -> Option<Product> {
        match tag {
            tag::NEWEST => return stack.newest(name, flavors),
            tag::SETUP => {
                let descriptor = env.setup_descriptor(name)?;
                return stack.find_product(name, &descriptor.version, &[descriptor.flavor]);
            }
            _ => {}
        }

        if let Some((flavor, version)) = self
            .user_tags
            .get(tag)
            .and_then(|bindings| bindings.get(name))
        {
            if flavors.contains(flavor) {
                if let Some(product) = stack.find_product(name, version, std::slice::from_ref(flavor)) {
                    return Some(product);
                }
                warn!(
                    "User tag \"{}\" of {} points at undeclared version {} ({})",
                    tag, name, version, flavor
                );
            }
        }

        stack.tagged_product(tag, name, flavors)
    }

    fn user_chain_file(&self, tag: &str) -> PathBuf {
        self.user_data.join(format!("{}{}", tag, CHAIN_SUFFIX))
    }

    /// Bind a user-scope tag, replacing any previous binding of the same
    /// product in the same atomic write.
    pub fn assign_user_tag(
        &mut self,
        tag: &Tag,
        name: &str,
        flavor: &Flavor,
        version: &Version,
    ) -> Result<(), EupsError> {
        let path = self.user_chain_file(tag.as_str());
        let contents = fs::read_to_string(&path).unwrap_or_default();
        let mut blocks = parse_blocks(&contents, PRODUCT_KEY);

        let mut block = BTreeMap::new();
        block.insert(String::from(PRODUCT_KEY), String::from(name));
        block.insert(String::from(FLAVOR_KEY), flavor.to_string());
        block.insert(String::from(VERSION_KEY), version.to_string());

        match blocks
            .iter_mut()
            .find(|existing| existing.get(PRODUCT_KEY).map(String::as_str) == Some(name))
        {
            Some(existing) => *existing = block,
            None => blocks.push(block),
        }

        atomic_write(&path, &render_blocks(&blocks, &[PRODUCT_KEY, FLAVOR_KEY, VERSION_KEY]))?;

        self.recognize(tag.as_str());
        self.user_tags
            .entry(tag.to_string())
            .or_default()
            .insert(String::from(name), (flavor.clone(), version.clone()));
        Ok(())
    }

    /// Remove a user-scope binding; the chain file disappears with its
    /// last entry.
    pub fn unassign_user_tag(&mut self, tag: &Tag, name: &str) -> Result<bool, EupsError> {
        let path = self.user_chain_file(tag.as_str());
        let contents = match fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(_) => return Ok(false),
        };

        let mut blocks = parse_blocks(&contents, PRODUCT_KEY);
        let before = blocks.len();
        blocks.retain(|block| block.get(PRODUCT_KEY).map(String::as_str) != Some(name));
        if blocks.len() == before {
            return Ok(false);
        }

        if blocks.is_empty() {
            fs::remove_file(&path).map_err(|err| EupsError::io(&path, err))?;
        } else {
            atomic_write(&path, &render_blocks(&blocks, &[PRODUCT_KEY, FLAVOR_KEY, VERSION_KEY]))?;
        }

        if let Some(bindings) = self.user_tags.get_mut(tag.as_str()) {
            bindings.remove(name);
            if bindings.is_empty() {
                self.user_tags.remove(tag.as_str());
            }
        }
        Ok(true)
    }

    pub fn user_binding(&self, tag: &str, name: &str) -> Option<&(Flavor, Version)> {
        self.user_tags.get(tag)?.get(name)
    }
}

#[cfg(test)]
mod tests {
    use assert_fs::prelude::{PathAssert, PathChild};
    use assert_fs::TempDir;
    use predicates::prelude::*;

    use crate::fixture;
    use crate::path::PathConfig;
    use crate::report::LogSink;

    use super::*;

    fn linux_chain() -> Vec<Flavor> {
        vec![Flavor::new("Linux"), Flavor::generic()]
    }

    fn open_stack(db: PathBuf, tmp_dir: &TempDir) -> ProductStack {
        ProductStack::new(
            vec![db],
            &PathConfig::default(),
            &tmp_dir.path().join(".eups"),
            &LogSink::default(),
        )
    }

    #[test]
    fn pseudo_tags_are_always_recognized() {
        let tmp_dir = TempDir::new().unwrap();
        let registry = TagRegistry::new(&tmp_dir.path().join(".eups"));

        for name in ["newest", "setup", "commandline"] {
            assert!(registry.is_recognized(name));
        }

        tmp_dir.close().unwrap();
    }

    #[test]
    fn stack_tags_are_recognized_after_loading() {
        let tmp_dir = TempDir::new().unwrap();
        let db = fixture::db::seed_basic(tmp_dir.path());
        let stack = open_stack(db, &tmp_dir);

        let mut registry = TagRegistry::new(&tmp_dir.path().join(".eups"));
        registry.recognize_from_stack(&stack);
        assert!(registry.is_recognized("current"));

        tmp_dir.close().unwrap();
    }

    #[test]
    fn set_preferred_rejects_unknown_tags() {
        let tmp_dir = TempDir::new().unwrap();
        let mut registry = TagRegistry::new(&tmp_dir.path().join(".eups"));

        let err = registry.set_preferred(&["goober"]).unwrap_err();
        assert!(matches!(err, EupsError::TagNotRecognized(name) if name == "goober"));

        tmp_dir.close().unwrap();
    }

    #[test]
    fn kindly_set_preferred_filters_and_keeps_previous_order() {
        let tmp_dir = TempDir::new().unwrap();
        let db = fixture::db::seed_basic(tmp_dir.path());
        let stack = open_stack(db, &tmp_dir);

        let mut registry = TagRegistry::new(&tmp_dir.path().join(".eups"));
        registry.recognize_from_stack(&stack);
        registry.recognize("stable");
        registry.recognize("beta");
        registry.set_preferred(&["stable", "current", "newest"]).unwrap();

        registry.set_preferred_kindly(&["goober", "gurn"]);
        assert_eq!(registry.preferred(), &["stable", "current", "newest"]);

        registry.set_preferred_kindly(&["goober", "stable", "gurn"]);
        assert_eq!(registry.preferred(), &["stable"]);

        registry.set_preferred_kindly(&["stable", "beta"]);
        assert_eq!(registry.preferred(), &["stable", "beta"]);

        tmp_dir.close().unwrap();
    }

    #[test]
    fn newest_resolves_to_the_highest_version() {
        let tmp_dir = TempDir::new().unwrap();
        let db = fixture::db::seed_basic(tmp_dir.path());
        let stack = open_stack(db, &tmp_dir);
        let registry = TagRegistry::new(&tmp_dir.path().join(".eups"));

        let product = registry
            .resolve("newest", "python", &stack, &linux_chain(), &EnvContext::new())
            .unwrap();
        assert_eq!(product.version(), &Version::new("2.6"));

        tmp_dir.close().unwrap();
    }

    #[test]
    fn setup_resolves_from_the_environment() {
        let tmp_dir = TempDir::new().unwrap();
        let db = fixture::db::seed_basic(tmp_dir.path());
        let stack = open_stack(db.clone(), &tmp_dir);
        let registry = TagRegistry::new(&tmp_dir.path().join(".eups"));

        let mut env = EnvContext::new();
        assert!(registry
            .resolve("setup", "python", &stack, &linux_chain(), &env)
            .is_none());

        env.set(
            "SETUP_PYTHON",
            format!("python Linux -g 2.6 -Z {}", db.display()),
        );
        let product = registry
            .resolve("setup", "python", &stack, &linux_chain(), &env)
            .unwrap();
        assert_eq!(product.version(), &Version::new("2.6"));

        tmp_dir.close().unwrap();
    }

    #[test]
    fn user_scope_shadows_the_global_binding() {
        let tmp_dir = TempDir::new().unwrap();
        let db = fixture::db::seed_basic(tmp_dir.path());
        let stack = open_stack(db, &tmp_dir);
        let user_data = tmp_dir.path().join(".eups");
        std::fs::create_dir_all(&user_data).unwrap();

        let mut registry = TagRegistry::new(&user_data);
        registry
            .assign_user_tag(
                &Tag::new("current"),
                "python",
                &Flavor::new("Linux"),
                &Version::new("2.6"),
            )
            .unwrap();

        // Global current points at 2.5.2; the user binding wins.
        let product = registry
            .resolve("current", "python", &stack, &linux_chain(), &EnvContext::new())
            .unwrap();
        assert_eq!(product.version(), &Version::new("2.6"));

        tmp_dir.close().unwrap();
    }

    #[test]
    fn user_tags_survive_a_reload() {
        let tmp_dir = TempDir::new().unwrap();
        let user_data = tmp_dir.path().join(".eups");
        std::fs::create_dir_all(&user_data).unwrap();

        let mut registry = TagRegistry::new(&user_data);
        registry
            .assign_user_tag(
                &Tag::new("mine"),
                "python",
                &Flavor::new("Linux"),
                &Version::new("2.5.2"),
            )
            .unwrap();

        let reloaded = TagRegistry::new(&user_data);
        assert!(reloaded.is_recognized("mine"));
        assert_eq!(
            reloaded.user_binding("mine", "python"),
            Some(&(Flavor::new("Linux"), Version::new("2.5.2")))
        );

        tmp_dir.close().unwrap();
    }

    #[test]
    fn unassigning_the_last_user_binding_deletes_the_chain() {
        let tmp_dir = TempDir::new().unwrap();
        let user_data = tmp_dir.path().join(".eups");
        std::fs::create_dir_all(&user_data).unwrap();

        let mut registry = TagRegistry::new(&user_data);
        registry
            .assign_user_tag(
                &Tag::new("mine"),
                "python",
                &Flavor::new("Linux"),
                &Version::new("2.5.2"),
            )
            .unwrap();
        tmp_dir.child(".eups/mine.chain").assert(predicate::path::exists());

        let removed = registry.unassign_user_tag(&Tag::new("mine"), "python").unwrap();
        assert!(removed);
        tmp_dir.child(".eups/mine.chain").assert(predicate::path::missing());
        assert_eq!(registry.user_binding("mine", "python"), None);

        tmp_dir.close().unwrap();
    }
}
