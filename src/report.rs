use log::{info, warn};
#[cfg(test)]
use mockall::automock;

/// How chatty recoverable problems are allowed to be.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Verbosity {
    Quiet,
    Normal,
    Verbose,
}

impl Default for Verbosity {
    fn default() -> Self {
        Verbosity::Normal
    }
}

/// Sink for recoverable problems: unresolved optional dependencies,
/// redundant tag operations, detected cycles, degraded caches. Everything
/// the library recovers from locally is reported here rather than raised.
#[cfg_attr(test, automock)]
pub trait WarningSink {
    fn warn(&self, message: &str);
    fn note(&self, message: &str);
}

/// Default sink forwarding to the log facade, honoring a verbosity level.
pub struct LogSink {
    verbosity: Verbosity,
}

impl LogSink {
    pub fn new(verbosity: Verbosity) -> Self {
        LogSink { verbosity }
    }
}

impl Default for LogSink {
    fn default() -> Self {
        LogSink::new(Verbosity::default())
    }
}

impl WarningSink for LogSink {
    fn warn(&self, message: &str) {
        if self.verbosity > Verbosity::Quiet {
            warn!("{}", message);
        }
    }

    fn note(&self, message: &str) {
        if self.verbosity >= Verbosity::Verbose {
            info!("{}", message);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_verbosity_is_normal() {
        assert_eq!(Verbosity::default(), Verbosity::Normal);
    }

    #[test]
    fn verbosity_levels_are_ordered() {
        assert!(Verbosity::Quiet < Verbosity::Normal);
        assert!(Verbosity::Normal < Verbosity::Verbose);
    }
}
