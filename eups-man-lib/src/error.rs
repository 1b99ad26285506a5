use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Errors surfaced by the product database and resolution layers.
#[derive(Error, Debug)]
pub enum EupsError {
    #[error("Product {product} {requested} not found for flavor {flavor}")]
    ProductNotFound {
        product: String,
        requested: String,
        flavor: String,
    },
    #[error("Tag \"{0}\" is not recognized")]
    TagNotRecognized(String),
    #[error("Dependencies require both {first} and {second} of product {product}")]
    VersionConflict {
        product: String,
        first: String,
        second: String,
    },
    #[error("A cyclic dependency exists amongst {0}")]
    CyclicDependency(String),
    #[error("Invalid version expression")]
    BadVersionExpr {
        #[from]
        source: VersionExprError,
    },
    #[error("IO error on {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Could not acquire lock on {path} within {seconds} seconds")]
    LockTimeout { path: PathBuf, seconds: u64 },
    #[error("Product {product} {version} is already declared with different metadata")]
    AlreadyDeclared { product: String, version: String },
    #[error("Multiple versions of {0} are declared, a version must be given")]
    AmbiguousVersion(String),
    #[error("No writable product database in the current path")]
    NoWritableDb,
    #[error("Unsupported platform ({os}, {arch}) and no flavor override is set")]
    UnsupportedPlatform { os: String, arch: String },
}

impl EupsError {
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        EupsError::Io {
            path: path.into(),
            source,
        }
    }

    pub fn product_not_found(product: &str, requested: &str, flavor: &str) -> Self {
        EupsError::ProductNotFound {
            product: String::from(product),
            requested: String::from(requested),
            flavor: String::from(flavor),
        }
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum VersionExprError {
    #[error("\"=\" is not a valid operator, use \"==\" for an exact match")]
    BareEquals,
    #[error("Operator \"{0}\" is missing a version operand")]
    MissingOperand(String),
    #[error("Version expression is empty")]
    Empty,
}
