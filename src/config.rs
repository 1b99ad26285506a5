use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::{env, fs};

use anyhow::{anyhow, Context};
use eups_man_lib::flavor::{FallbackFlavors, Flavor};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};

lazy_static! {
    static ref ENV_REGEX: Regex = Regex::new(r"(\$([A-Za-z0-9_]+))").unwrap();
    /// Tag precedence applied when neither the user config nor the caller
    /// sets one.
    pub static ref DEFAULT_PREFERRED_TAGS: Vec<String> = vec![
        String::from("stable"),
        String::from("current"),
        String::from("newest"),
    ];
}

/// Optional per-user configuration read from `<userdata>/config.yml`:
/// the preferred-tag order, per-flavor fallback lists, and extra database
/// roots appended to the configured path (with environment variables
/// expanded).
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct UserConfig {
    preferred_tags: Option<Vec<String>>,
    flavor_fallbacks: Option<HashMap<String, Vec<String>>>,
    extra_db_paths: Option<Vec<String>>,
}

impl UserConfig {
    pub fn read_config(path: &Path) -> anyhow::Result<Self> {
        let yaml = match fs::read_to_string(path) {
            Ok(yaml) => yaml,
            Err(err) => match err.kind() {
                ErrorKind::NotFound => return Ok(UserConfig::default()),
                _ => {
                    return Err(anyhow!(err).context(format!("Could not read config from {}", path.display())))
                }
            },
        };

        serde_yaml::from_str(&yaml).context("Could not deserialize YAML into the user config")
    }

    pub fn preferred_tags(&self) -> Option<&[String]> {
        self.preferred_tags.as_deref()
    }

    /// Fallback lists keyed by flavor; the "default" key feeds the
    /// catch-all entry.
    pub fn fallback_flavors(&self) -> FallbackFlavors {
        let mut fallbacks = FallbackFlavors::new();
        if let Some(configured) = &self.flavor_fallbacks {
            for (flavor, list) in configured {
                let key = if flavor == "default" {
                    None
                } else {
                    Some(Flavor::new(flavor.as_str()))
                };
                fallbacks.set_fallbacks(key, list.iter().map(|f| Flavor::new(f.as_str())).collect());
            }
        }
        fallbacks
    }

    /// Extra database roots to append to the search path, after env-var
    /// expansion. Entries referencing unset variables are errors.
    pub fn extra_db_paths(&self) -> anyhow::Result<Vec<PathBuf>> {
        let mut paths = Vec::new();
        for entry in self.extra_db_paths.iter().flatten() {
            let expanded = path_with_expanded_env_vars(entry)
                .context(format!("Configured extra db path {} is not valid", entry))?;
            paths.push(PathBuf::from(expanded));
        }
        Ok(paths)
    }
}

fn path_with_expanded_env_vars(str: &str) -> anyhow::Result<String> {
    let mut expanded_path = String::from(str);
    let captures = ENV_REGEX.captures_iter(str);

    for cap in captures {
        let env_name = &cap[1];
        let env_value = env::var(&cap[2]).context(format!("Environment variable {} does not exist", &cap[2]))?;

        expanded_path = expanded_path.replace(env_name, &env_value);
    }

    Ok(expanded_path)
}
