use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

/// Pseudo-tag resolved to the highest-comparing declared version.
pub const NEWEST: &str = "newest";
/// Pseudo-tag resolved from the active environment.
pub const SETUP: &str = "setup";
/// Query-only marker for versions given explicitly on a command line.
pub const COMMANDLINE: &str = "commandline";

/// A symbolic name bound to a concrete version of a product, e.g.
/// "current" or "stable". Pseudo-tags never persist to disk.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(transparent)]
pub struct Tag(String);

impl Tag {
    pub fn new<S: Into<String>>(value: S) -> Self {
        Tag(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_pseudo(&self) -> bool {
        pseudo_tags().contains(&self.0.as_str())
    }
}

pub fn pseudo_tags() -> [&'static str; 3] {
    [NEWEST, SETUP, COMMANDLINE]
}

impl From<&str> for Tag {
    fn from(s: &str) -> Self {
        Tag::new(s)
    }
}

impl From<String> for Tag {
    fn from(s: String) -> Self {
        Tag::new(s)
    }
}

impl AsRef<str> for Tag {
    fn as_ref(&self) -> &str {
        self.0.as_ref()
    }
}

impl PartialEq<str> for Tag {
    fn eq(&self, other: &str) -> bool {
        self.0.eq(other)
    }
}

impl PartialEq<String> for Tag {
    fn eq(&self, other: &String) -> bool {
        self.0.eq(other)
    }
}

impl Display for Tag {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Where a tag binding lives: in the product database itself, or in the
/// invoking user's data directory.
#[derive(Clone, Copy, Serialize, Deserialize, Debug, PartialEq, Eq)]
pub enum TagScope {
    Global,
    User,
}

impl Display for TagScope {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TagScope::Global => "global",
            TagScope::User => "user",
        };
        write!(f, "{}", name)
    }
}
