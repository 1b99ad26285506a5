use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::path::PathBuf;

use eups_man_lib::flavor::Flavor;
use eups_man_lib::version::Version;

pub const EUPS_PATH: &str = "EUPS_PATH";
pub const EUPS_FLAVOR: &str = "EUPS_FLAVOR";
pub const EUPS_USERDATA: &str = "EUPS_USERDATA";
pub const SETUP_PREFIX: &str = "SETUP_";

/// Name of the variable carrying a product's install directory, e.g.
/// "PYTHON_DIR".
pub fn dir_env_name(product: &str) -> String {
    format!("{}_DIR", product.to_uppercase())
}

/// An explicit, mutable snapshot of the process environment. The library
/// never touches `std::env` for its outputs; `setup`/`unsetup` mutate a
/// context owned by the caller, who decides how to export it.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EnvContext {
    vars: BTreeMap<String, String>,
}

impl EnvContext {
    pub fn new() -> Self {
        EnvContext::default()
    }

    pub fn from_process() -> Self {
        EnvContext {
            vars: std::env::vars().collect(),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    pub fn set<K: Into<String>, V: Into<String>>(&mut self, key: K, value: V) {
        self.vars.insert(key.into(), value.into());
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.vars.remove(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.vars.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// The configured database roots, in priority order.
    pub fn eups_path(&self) -> Vec<PathBuf> {
        self.get(EUPS_PATH)
            .map(|path| {
                path.split(':')
                    .filter(|dir| !dir.is_empty())
                    .map(PathBuf::from)
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn flavor_override(&self) -> Option<&str> {
        self.get(EUPS_FLAVOR)
    }

    pub fn user_data_override(&self) -> Option<PathBuf> {
        self.get(EUPS_USERDATA).map(PathBuf::from)
    }

    /// The SETUP_* variable naming for a product: an exact match if
    /// present, else a case-insensitive one, else the upper-cased form.
    pub fn setup_env_name(&self, product: &str) -> String {
        let exact = format!("{}{}", SETUP_PREFIX, product);
        if self.vars.contains_key(&exact) {
            return exact;
        }

        let lowered = exact.to_lowercase();
        self.vars
            .keys()
            .find(|key| key.to_lowercase() == lowered)
            .cloned()
            .unwrap_or_else(|| exact.to_uppercase())
    }

    /// Parse the setup descriptor for one product, if it is setup.
    pub fn setup_descriptor(&self, product: &str) -> Option<SetupDescriptor> {
        let name = self.setup_env_name(product);
        self.get(&name).and_then(SetupDescriptor::parse)
    }

    /// All products recorded as setup in this environment.
    pub fn setup_products(&self) -> Vec<SetupDescriptor> {
        self.vars
            .iter()
            .filter(|(key, _)| key.starts_with(SETUP_PREFIX))
            .filter_map(|(_, value)| SetupDescriptor::parse(value))
            .collect()
    }
}

/// The value of a SETUP_<NAME> variable:
/// "<name> <flavor> -g <version> -Z <db>".
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SetupDescriptor {
    pub product: String,
    pub flavor: Flavor,
    pub version: Version,
    pub db: PathBuf,
}

impl SetupDescriptor {
    pub fn new(product: &str, flavor: Flavor, version: Version, db: PathBuf) -> Self {
        SetupDescriptor {
            product: String::from(product),
            flavor,
            version,
            db,
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        let mut tokens = value.split_whitespace();
        let product = tokens.next()?;
        let flavor = tokens.next()?;

        let mut version = None;
        let mut db = None;
        while let Some(token) = tokens.next() {
            match token {
                "-g" => version = tokens.next(),
                "-Z" => db = tokens.next(),
                _ => continue,
            }
        }

        Some(SetupDescriptor {
            product: String::from(product),
            flavor: Flavor::new(flavor),
            version: Version::new(version?),
            db: PathBuf::from(db?),
        })
    }
}

impl Display for SetupDescriptor {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} {} -g {} -Z {}",
            self.product,
            self.flavor,
            self.version,
            self.db.display()
        )
    }
}
