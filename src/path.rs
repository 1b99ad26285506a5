use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
#[cfg(test)]
use mockall::automock;

pub const USER_DATA_DIR_NAME: &str = ".eups";
pub const CACHE_MIRROR_DIR: &str = "_caches_";
pub const USER_CONFIG_FILE: &str = "config.yml";

const DB_LOCK_FILE: &str = ".lock";
const CACHE_LOCK_FILE: &str = ".cache.lock";

/// Derives every on-disk location used by the product database layer.
/// Implementors only need to override methods when a test or an embedding
/// application relocates part of the tree.
#[cfg_attr(test, automock)]
pub trait PathConfiguration {
    /// The per-user data directory: an explicit override if given,
    /// otherwise ~/.eups.
    fn user_data_dir(&self, userdata: Option<PathBuf>) -> PathBuf {
        userdata.unwrap_or_else(|| {
            dirs::home_dir()
                .map(|home| home.join(USER_DATA_DIR_NAME))
                .unwrap_or_else(|| PathBuf::from(USER_DATA_DIR_NAME))
        })
    }

    fn product_dir(&self, db: &Path, product: &str) -> PathBuf {
        db.join(product)
    }

    fn version_file(&self, db: &Path, product: &str, version: &str) -> PathBuf {
        self.product_dir(db, product).join(format!("{}.version", version))
    }

    fn chain_file(&self, db: &Path, product: &str, tag: &str) -> PathBuf {
        self.product_dir(db, product).join(format!("{}.chain", tag))
    }

    fn cache_file(&self, db: &Path, flavor: &str) -> PathBuf {
        db.join(format!(".cache.{}", flavor))
    }

    fn db_lock_file(&self, db: &Path) -> PathBuf {
        db.join(DB_LOCK_FILE)
    }

    fn cache_lock_file(&self, db: &Path) -> PathBuf {
        db.join(CACHE_LOCK_FILE)
    }

    /// Mirror directory in the user data dir that receives cache files
    /// for a database the user cannot write to.
    fn user_cache_dir(&self, user_data: &Path, db: &Path) -> PathBuf {
        let mirror = db.strip_prefix("/").unwrap_or(db);
        user_data.join(CACHE_MIRROR_DIR).join(mirror)
    }

    fn user_chain_file(&self, user_data: &Path, tag: &str) -> PathBuf {
        user_data.join(format!("{}.chain", tag))
    }

    fn user_config_file(&self, user_data: &Path) -> PathBuf {
        user_data.join(USER_CONFIG_FILE)
    }

    fn create_user_dirs(&self, user_data: &Path) -> anyhow::Result<()> {
        let cache_mirror = user_data.join(CACHE_MIRROR_DIR);

        fs::create_dir_all(user_data).context(format!(
            r#"Failed to create user data directory "{}""#,
            user_data.display()
        ))?;
        fs::create_dir_all(&cache_mirror).context(format!(
            r#"Failed to create directory "{}" in {}"#,
            CACHE_MIRROR_DIR,
            user_data.display()
        ))?;

        Ok(())
    }
}

pub struct PathConfig {}

impl PathConfig {
    pub fn new() -> Self {
        PathConfig {}
    }
}

impl Default for PathConfig {
    fn default() -> Self {
        PathConfig::new()
    }
}

impl PathConfiguration for PathConfig {}

#[cfg(test)]
mod tests {
    use assert_fs::prelude::{PathAssert, PathChild};
    use assert_fs::TempDir;
    use predicates::prelude::*;

    use super::*;

    #[test]
    fn user_data_dir_defaults_to_home_dot_eups() {
        let path_cfg = PathConfig::default();
        let path = path_cfg.user_data_dir(None);
        assert!(path.to_string_lossy().ends_with(".eups"));
    }

    #[test]
    fn user_data_dir_honors_override() {
        let path_cfg = PathConfig::default();
        let path = path_cfg.user_data_dir(Some(PathBuf::from("/tmp/eups-userdata")));
        assert_eq!(path, PathBuf::from("/tmp/eups-userdata"));
    }

    #[test]
    fn version_and_chain_files_live_in_the_product_dir() {
        let path_cfg = PathConfig::default();
        let db = Path::new("/eups/db");
        assert_eq!(
            path_cfg.version_file(db, "python", "2.5.2"),
            PathBuf::from("/eups/db/python/2.5.2.version")
        );
        assert_eq!(
            path_cfg.chain_file(db, "python", "beta"),
            PathBuf::from("/eups/db/python/beta.chain")
        );
    }

    #[test]
    fn cache_file_is_flavor_scoped() {
        let path_cfg = PathConfig::default();
        assert_eq!(
            path_cfg.cache_file(Path::new("/eups/db"), "Linux64"),
            PathBuf::from("/eups/db/.cache.Linux64")
        );
    }

    #[test]
    fn user_cache_dir_mirrors_the_db_path() {
        let path_cfg = PathConfig::default();
        let mirror = path_cfg.user_cache_dir(Path::new("/home/user/.eups"), Path::new("/eups/db"));
        assert_eq!(mirror, PathBuf::from("/home/user/.eups/_caches_/eups/db"));
    }

    #[test]
    fn create_user_dirs_builds_the_mirror_root() {
        let tmp_dir = TempDir::new().unwrap();
        let user_data = tmp_dir.path().join(".eups");

        let path_cfg = PathConfig::default();
        path_cfg.create_user_dirs(&user_data).unwrap();

        tmp_dir.child(".eups/_caches_").assert(predicate::path::exists());

        tmp_dir.close().unwrap();
    }
}
