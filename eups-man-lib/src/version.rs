use std::cmp::Ordering;
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

use crate::error::VersionExprError;

/// A declared product version. The raw text is kept verbatim so that
/// round-trips through the store are exact; ordering is defined by dotted
/// numeric-then-lexical segmentation.
#[derive(Clone, Serialize, Deserialize, Debug)]
#[serde(transparent)]
pub struct Version {
    raw: String,
}

impl Version {
    pub fn new<S: Into<String>>(raw: S) -> Self {
        Version { raw: raw.into() }
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

// Segments that both parse as integers compare numerically, with the raw
// text as a tie break so that e.g. "01" and "1" still order consistently.
fn compare_segment(a: &str, b: &str) -> Ordering {
    match (a.parse::<u64>(), b.parse::<u64>()) {
        (Ok(x), Ok(y)) => x.cmp(&y).then_with(|| a.cmp(b)),
        _ => a.cmp(b),
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        let mut left = self.raw.split('.');
        let mut right = other.raw.split('.');
        loop {
            match (left.next(), right.next()) {
                (Some(a), Some(b)) => {
                    let ordering = compare_segment(a, b);
                    if ordering != Ordering::Equal {
                        return ordering;
                    }
                }
                (Some(_), None) => return Ordering::Greater,
                (None, Some(_)) => return Ordering::Less,
                (None, None) => return Ordering::Equal,
            }
        }
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Version {}

impl PartialEq<str> for Version {
    fn eq(&self, other: &str) -> bool {
        self.raw.eq(other)
    }
}

impl PartialEq<String> for Version {
    fn eq(&self, other: &String) -> bool {
        self.raw.eq(other)
    }
}

impl From<&str> for Version {
    fn from(s: &str) -> Self {
        Version::new(s)
    }
}

impl From<String> for Version {
    fn from(s: String) -> Self {
        Version::new(s)
    }
}

impl AsRef<str> for Version {
    fn as_ref(&self) -> &str {
        self.raw.as_ref()
    }
}

impl Display for Version {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.raw)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Le,
    Ge,
    Lt,
    Gt,
}

impl CompareOp {
    fn accepts(&self, ordering: Ordering) -> bool {
        match self {
            CompareOp::Eq => ordering == Ordering::Equal,
            CompareOp::Ne => ordering != Ordering::Equal,
            CompareOp::Le => ordering != Ordering::Greater,
            CompareOp::Ge => ordering != Ordering::Less,
            CompareOp::Lt => ordering == Ordering::Less,
            CompareOp::Gt => ordering == Ordering::Greater,
        }
    }
}

/// A version request: either a literal version (exact match) or a
/// relational predicate such as ">= 2.5.2". A bare "=" is rejected.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum VersionExpr {
    Exact(Version),
    Predicate { op: CompareOp, rhs: Version },
}

const OPERATORS: [(&str, CompareOp); 6] = [
    ("==", CompareOp::Eq),
    ("!=", CompareOp::Ne),
    ("<=", CompareOp::Le),
    (">=", CompareOp::Ge),
    ("<", CompareOp::Lt),
    (">", CompareOp::Gt),
];

impl VersionExpr {
    pub fn parse(expr: &str) -> Result<Self, VersionExprError> {
        let expr = expr.trim();
        if expr.is_empty() {
            return Err(VersionExprError::Empty);
        }

        for (token, op) in OPERATORS {
            if let Some(rest) = expr.strip_prefix(token) {
                let rhs = rest.trim();
                if rhs.is_empty() {
                    return Err(VersionExprError::MissingOperand(String::from(token)));
                }
                return Ok(VersionExpr::Predicate {
                    op,
                    rhs: Version::new(rhs),
                });
            }
        }

        if expr.starts_with('=') {
            return Err(VersionExprError::BareEquals);
        }

        Ok(VersionExpr::Exact(Version::new(expr)))
    }

    pub fn matches(&self, candidate: &Version) -> bool {
        match self {
            VersionExpr::Exact(version) => candidate == version,
            VersionExpr::Predicate { op, rhs } => op.accepts(candidate.cmp(rhs)),
        }
    }

    /// Return the subset of candidates satisfying this expression,
    /// preserving the input order.
    pub fn filter<'a, I>(&self, candidates: I) -> Vec<&'a Version>
    where
        I: IntoIterator<Item = &'a Version>,
    {
        candidates
            .into_iter()
            .filter(|candidate| self.matches(candidate))
            .collect()
    }
}

impl TryFrom<&str> for VersionExpr {
    type Error = VersionExprError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        VersionExpr::parse(value)
    }
}

impl Display for VersionExpr {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            VersionExpr::Exact(version) => write!(f, "{}", version),
            VersionExpr::Predicate { op, rhs } => {
                let token = OPERATORS
                    .iter()
                    .find(|(_, candidate)| candidate == op)
                    .map(|(token, _)| *token)
                    .unwrap_or("==");
                write!(f, "{} {}", token, rhs)
            }
        }
    }
}
