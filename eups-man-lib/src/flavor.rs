use std::collections::HashMap;
use std::fmt::{Display, Formatter};

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::EupsError;

pub const GENERIC: &str = "Generic";

lazy_static! {
    static ref SIXTY_FOUR_BIT: Regex = Regex::new(r"64$").unwrap();
    static ref INTEL_32_BIT: Regex = Regex::new(r"^(i\d86|x86)$").unwrap();
}

/// A platform identifier such as "Linux64". The "Generic" flavor matches
/// any platform and is always consulted as a last resort.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(transparent)]
pub struct Flavor(String);

impl Flavor {
    pub fn new<S: Into<String>>(value: S) -> Self {
        Flavor(value.into())
    }

    pub fn generic() -> Self {
        Flavor::new(GENERIC)
    }

    pub fn is_generic(&self) -> bool {
        self.0 == GENERIC
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Flavor {
    fn from(s: &str) -> Self {
        Flavor::new(s)
    }
}

impl From<String> for Flavor {
    fn from(s: String) -> Self {
        Flavor::new(s)
    }
}

impl AsRef<str> for Flavor {
    fn as_ref(&self) -> &str {
        self.0.as_ref()
    }
}

impl PartialEq<str> for Flavor {
    fn eq(&self, other: &str) -> bool {
        self.0.eq(other)
    }
}

impl Display for Flavor {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Determine the running flavor. An explicit override wins; otherwise the
/// flavor is derived from the OS and machine architecture.
pub fn determine_flavor(flavor_override: Option<&str>) -> Result<Flavor, EupsError> {
    if let Some(flavor) = flavor_override {
        return Ok(Flavor::new(flavor));
    }
    flavor_for(std::env::consts::OS, std::env::consts::ARCH)
}

pub fn flavor_for(os: &str, arch: &str) -> Result<Flavor, EupsError> {
    let flavor = match os {
        "linux" => {
            if SIXTY_FOUR_BIT.is_match(arch) {
                Flavor::new("Linux64")
            } else {
                Flavor::new("Linux")
            }
        }
        "macos" => {
            if INTEL_32_BIT.is_match(arch) {
                Flavor::new("DarwinX86")
            } else {
                Flavor::new("Darwin")
            }
        }
        _ => {
            return Err(EupsError::UnsupportedPlatform {
                os: String::from(os),
                arch: String::from(arch),
            })
        }
    };
    Ok(flavor)
}

/// Ordered lists of alternate flavors to consult when a product is not
/// declared for the primary flavor. The `None` key holds the default list
/// applied to flavors without a specific entry.
#[derive(Clone, Debug, Default)]
pub struct FallbackFlavors {
    fallbacks: HashMap<Option<Flavor>, Vec<Flavor>>,
}

impl FallbackFlavors {
    pub fn new() -> Self {
        let mut fallbacks = HashMap::new();
        fallbacks.insert(None, Vec::new());
        FallbackFlavors { fallbacks }
    }

    pub fn set_fallbacks(&mut self, flavor: Option<Flavor>, list: Vec<Flavor>) {
        self.fallbacks.insert(flavor, list);
    }

    /// The full lookup chain for a flavor: the flavor itself, its
    /// configured fallbacks, and finally "Generic".
    pub fn chain(&self, flavor: &Flavor) -> Vec<Flavor> {
        let alternates = self
            .fallbacks
            .get(&Some(flavor.clone()))
            .or_else(|| self.fallbacks.get(&None))
            .cloned()
            .unwrap_or_default();

        let mut chain = vec![flavor.clone()];
        for alternate in alternates {
            if !chain.contains(&alternate) {
                chain.push(alternate);
            }
        }
        let generic = Flavor::generic();
        if !chain.contains(&generic) {
            chain.push(generic);
        }
        chain
    }
}
