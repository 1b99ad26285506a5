//! Shared builders for tests: seeded product databases and products.

use std::path::{Path, PathBuf};

use crate::data::Product;

/// Route log output through the test harness; safe to call repeatedly.
pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub mod db {
    use std::fs;

    use super::*;

    /// Seed `root/ups_db` with a small known stack:
    /// python 2.5.2 (current) and 2.6, eigen 2.0.0 (current), cfitsio
    /// 3.006.2, and doxygen 1.5.7.1 on Linux / 1.5.9 on Linux64.
    pub fn seed_basic(root: &Path) -> PathBuf {
        let db = root.join("ups_db");

        declare(&db, root, "python", "2.5.2", "Linux");
        declare(&db, root, "python", "2.6", "Linux");
        chain(&db, "python", "current", &[("Linux", "2.5.2")]);

        declare(&db, root, "eigen", "2.0.0", "Linux");
        chain(&db, "eigen", "current", &[("Linux", "2.0.0")]);

        declare(&db, root, "cfitsio", "3.006.2", "Linux");

        declare(&db, root, "doxygen", "1.5.7.1", "Linux");
        declare(&db, root, "doxygen", "1.5.9", "Linux64");

        db
    }

    /// Declare one (product, version, flavor) the way the store would,
    /// but with raw writes so tests do not depend on the code under test.
    pub fn declare(db: &Path, root: &Path, name: &str, version: &str, flavor: &str) {
        let product_dir = db.join(name);
        fs::create_dir_all(&product_dir).unwrap();

        let install_dir = root.join(flavor).join(name).join(version);
        fs::create_dir_all(&install_dir).unwrap();

        let contents = format!(
            "FLAVOR = {}\nVERSION = {}\nPROD_DIR = {}\nTABLE_FILE = none\n",
            flavor,
            version,
            install_dir.display(),
        );
        let file = product_dir.join(format!("{}.version", version));
        match fs::read_to_string(&file) {
            Ok(existing) => fs::write(&file, format!("{}\n{}", existing, contents)).unwrap(),
            Err(_) => fs::write(&file, contents).unwrap(),
        }
    }

    pub fn chain(db: &Path, name: &str, tag: &str, entries: &[(&str, &str)]) {
        let product_dir = db.join(name);
        fs::create_dir_all(&product_dir).unwrap();

        let contents: String = entries
            .iter()
            .map(|(flavor, version)| format!("FLAVOR = {}\nVERSION = {}\n", flavor, version))
            .collect::<Vec<String>>()
            .join("\n");
        fs::write(product_dir.join(format!("{}.chain", tag)), contents).unwrap();
    }

    /// Write a table file for a product and point its declaration at it.
    pub fn table(db: &Path, name: &str, version: &str, directives: &str) {
        let product_dir = db.join(name);
        fs::create_dir_all(&product_dir).unwrap();
        let table_path = product_dir.join(format!("{}.table", name));
        fs::write(&table_path, directives).unwrap();

        let file = product_dir.join(format!("{}.version", version));
        let contents = fs::read_to_string(&file).unwrap();
        let rewritten = contents.replace("TABLE_FILE = none", &format!("TABLE_FILE = {}", table_path.display()));
        fs::write(&file, rewritten).unwrap();
    }

    #[cfg(unix)]
    pub fn make_unwritable(db: &Path) {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(db, fs::Permissions::from_mode(0o555)).unwrap();
    }

    #[cfg(unix)]
    pub fn make_writable(db: &Path) {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(db, fs::Permissions::from_mode(0o755)).unwrap();
    }
}

pub mod product {
    use super::*;

    pub fn python_252(db: &Path) -> Product {
        Product::new("python", "2.5.2", "Linux", db)
            .with_dir(Some(PathBuf::from("/opt/python/2.5.2")))
    }

    pub fn python_26(db: &Path) -> Product {
        Product::new("python", "2.6", "Linux", db).with_dir(Some(PathBuf::from("/opt/python/2.6")))
    }
}
