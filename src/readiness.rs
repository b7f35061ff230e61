//! Readiness probes
//!
//! A task becomes ready when its probe fires. Dependent tasks wait on that
//! signal instead of sleeping a fixed amount.

use std::time::Duration;

/// When a running task counts as ready
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadinessProbe {
    /// Ready as soon as the remote process has started
    Immediate,
    /// Ready once the process has been running for this long
    Delay(Duration),
    /// Ready once this text shows up on stdout or stderr
    Pattern(String),
}

impl Default for ReadinessProbe {
    fn default() -> Self {
        Self::Immediate
    }
}

/// Incremental matcher for [`ReadinessProbe::Pattern`].
///
/// Output arrives in arbitrary chunks, so the tail of the current line is
/// carried over between calls. Matching is done on bytes, which keeps a
/// multibyte character split across chunks intact. Patterns never span a
/// newline.
#[derive(Debug)]
pub struct PatternScanner {
    pattern: Vec<u8>,
    /// Unmatched tail of the current line, at most `pattern.len() - 1` bytes
    partial: Vec<u8>,
}

impl PatternScanner {
    pub fn new(pattern: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into().into_bytes(),
            partial: Vec::new(),
        }
    }

    /// Feed a chunk; returns true if the pattern is seen
    pub fn feed(&mut self, chunk: &[u8]) -> bool {
        self.partial.extend_from_slice(chunk);
        let found = self
            .partial
            .split(|b| *b == b'\n')
            .any(|line| contains(line, &self.pattern));

        if let Some(idx) = self.partial.iter().rposition(|b| *b == b'\n') {
            self.partial.drain(..=idx);
        }
        // Any later match must start inside the last len-1 bytes
        let keep = self.pattern.len().saturating_sub(1);
        if self.partial.len() > keep {
            let excess = self.partial.len() - keep;
            self.partial.drain(..excess);
        }
        found
    }
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    needle.is_empty() || haystack.windows(needle.len()).any(|w| w == needle)
}
