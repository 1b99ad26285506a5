use std::fmt::{Display, Formatter};
use std::path::{Path, PathBuf};

use eups_man_lib::flavor::Flavor;
use eups_man_lib::tag::Tag;
use eups_man_lib::version::Version;
use serde::{Deserialize, Serialize};

/// Placeholder values recorded when a product has no install directory or
/// table file.
const PLACEHOLDERS: [&str; 3] = ["none", "???", "(none)"];

/// Return true iff `filename` names a real file, not a placeholder. The
/// file itself need not exist.
pub fn is_real_filename(filename: &str) -> bool {
    !filename.is_empty() && !PLACEHOLDERS.contains(&filename)
}

/// An installed software unit: one declared (name, version, flavor) in a
/// product database.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Eq)]
pub struct Product {
    name: String,
    version: Version,
    flavor: Flavor,
    db: PathBuf,
    dir: Option<PathBuf>,
    table_file: Option<PathBuf>,
    tags: Vec<Tag>,
}

impl Product {
    pub fn new<N, V, F, D>(name: N, version: V, flavor: F, db: D) -> Self
    where
        N: Into<String>,
        V: Into<Version>,
        F: Into<Flavor>,
        D: Into<PathBuf>,
    {
        Product {
            name: name.into(),
            version: version.into(),
            flavor: flavor.into(),
            db: db.into(),
            dir: None,
            table_file: None,
            tags: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> &Version {
        &self.version
    }

    pub fn flavor(&self) -> &Flavor {
        &self.flavor
    }

    pub fn db(&self) -> &Path {
        &self.db
    }

    pub fn dir(&self) -> Option<&Path> {
        self.dir.as_deref()
    }

    pub fn set_dir(&mut self, dir: Option<PathBuf>) {
        self.dir = dir.filter(|d| is_real_filename(&d.to_string_lossy()));
    }

    pub fn with_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.set_dir(dir);
        self
    }

    pub fn table_file(&self) -> Option<&Path> {
        self.table_file.as_deref()
    }

    pub fn set_table_file(&mut self, table_file: Option<PathBuf>) {
        self.table_file = table_file.filter(|t| is_real_filename(&t.to_string_lossy()));
    }

    pub fn with_table_file(mut self, table_file: Option<PathBuf>) -> Self {
        self.set_table_file(table_file);
        self
    }

    pub fn tags(&self) -> &[Tag] {
        &self.tags
    }

    pub fn has_tag(&self, tag: &Tag) -> bool {
        self.tags.contains(tag)
    }

    pub fn add_tag(&mut self, tag: Tag) {
        if !self.tags.contains(&tag) {
            self.tags.push(tag);
            self.tags.sort();
        }
    }

    pub fn remove_tag(&mut self, tag: &Tag) {
        self.tags.retain(|t| t != tag);
    }

    pub fn set_tags(&mut self, mut tags: Vec<Tag>) {
        tags.sort();
        tags.dedup();
        self.tags = tags;
    }

    /// Identity within a stack: products from different roots shadow one
    /// another when these three agree.
    pub fn identity(&self) -> (&str, &str, &str) {
        (&self.name, self.version.as_str(), self.flavor.as_str())
    }
}

impl Display for Product {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {} ({})", self.name, self.version, self.flavor)
    }
}
