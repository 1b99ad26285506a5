use std::fs;
use std::path::Path;

use lazy_static::lazy_static;
use log::warn;
use regex::Regex;

use crate::error::EupsError;

lazy_static! {
    static ref DIRECTIVE: Regex =
        Regex::new(r"^(setupRequired|setupOptional)\s*\(([^)]*)\)\s*$").unwrap();
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DependKind {
    Required,
    Optional,
}

/// One dependency record extracted from a product's table file. The table
/// grammar itself is owned by an external collaborator; this module only
/// consumes the flattened directive form.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Dependency {
    pub kind: DependKind,
    pub name: String,
    pub version_expr: Option<String>,
}

impl Dependency {
    pub fn required<S: Into<String>>(name: S, version_expr: Option<String>) -> Self {
        Dependency {
            kind: DependKind::Required,
            name: name.into(),
            version_expr,
        }
    }

    pub fn optional<S: Into<String>>(name: S, version_expr: Option<String>) -> Self {
        Dependency {
            kind: DependKind::Optional,
            name: name.into(),
            version_expr,
        }
    }

    pub fn is_required(&self) -> bool {
        self.kind == DependKind::Required
    }
}

/// Read the flattened setupRequired/setupOptional directives of a table
/// file, in declaration order. Lines that are not dependency directives
/// (comments, environment actions, per-flavor qualifiers) are skipped.
pub fn parse_table(path: &Path) -> Result<Vec<Dependency>, EupsError> {
    let contents = fs::read_to_string(path).map_err(|err| EupsError::io(path, err))?;
    Ok(parse_directives(&contents, path))
}

fn parse_directives(contents: &str, origin: &Path) -> Vec<Dependency> {
    let mut dependencies = Vec::new();
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let captures = match DIRECTIVE.captures(line) {
            Some(captures) => captures,
            None => continue,
        };

        let kind = if &captures[1] == "setupRequired" {
            DependKind::Required
        } else {
            DependKind::Optional
        };

        // Option flags such as "-j" belong to the front-end and are
        // discarded here.
        let mut tokens = captures[2]
            .split_whitespace()
            .filter(|token| !token.starts_with('-'));
        let name = match tokens.next() {
            Some(name) => String::from(name),
            None => {
                warn!("Ignoring dependency directive without a product name in {}", origin.display());
                continue;
            }
        };
        let rest: Vec<&str> = tokens.collect();
        let version_expr = if rest.is_empty() {
            None
        } else {
            Some(rest.join(" "))
        };

        dependencies.push(Dependency {
            kind,
            name,
            version_expr,
        });
    }
    dependencies
}
