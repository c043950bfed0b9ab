use crate::criu::util::{pipe_max_size, PAGE_SIZE};
use crate::error::{MemError, Result};

/// Pages a single page pipe buffer may hold by default (1MiB of pages,
/// the default pipe-max-size).
pub const PIPE_MAX_PAGES: usize = 256;

/// Page dump options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DumpOpts {
    /// Page budget of one pipe buffer, i.e. of one dump_pages round trip
    pub pages_per_pipe: usize,
    /// Largest pipe an unprivileged user may create, in bytes
    pub pipe_max_size: usize,
}

impl Default for DumpOpts {
    fn default() -> Self {
        Self {
            pages_per_pipe: PIPE_MAX_PAGES,
            pipe_max_size: pipe_max_size(),
        }
    }
}

impl DumpOpts {
    pub fn with_pages_per_pipe(mut self, pages: usize) -> Self {
        self.pages_per_pipe = pages;
        self
    }

    /// The parasite fills a whole pipe before anybody drains it, so every
    /// buffer must fit into a single pipe.
    pub fn validate(&self) -> Result<()> {
        if self.pages_per_pipe == 0 {
            return Err(invalid("pages per pipe must be positive"));
        }

        if self.pages_per_pipe * PAGE_SIZE > self.pipe_max_size {
            return Err(invalid(&format!(
                "{} pages per pipe exceed pipe-max-size {}",
                self.pages_per_pipe, self.pipe_max_size
            )));
        }

        Ok(())
    }
}

fn invalid(reason: &str) -> MemError {
    MemError::Io(std::io::Error::new(std::io::ErrorKind::InvalidInput, reason.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_budget() {
        let opts = DumpOpts {
            pipe_max_size: 1024 * 1024,
            ..Default::default()
        };
        assert_eq!(opts.pages_per_pipe, 256);
        assert!(opts.validate().is_ok());
    }

    #[test]
    fn test_rejects_zero_budget() {
        let opts = DumpOpts::default().with_pages_per_pipe(0);
        assert!(opts.validate().is_err());
    }

    #[test]
    fn test_rejects_budget_over_pipe_max() {
        let opts = DumpOpts {
            pages_per_pipe: 512,
            pipe_max_size: 1024 * 1024,
        };
        assert!(opts.validate().is_err());
    }
}
