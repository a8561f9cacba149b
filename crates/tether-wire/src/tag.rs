//! Correlation tag generation.

use std::process;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use once_cell::sync::Lazy;

static PROCESS_TAGS: Lazy<TagGenerator> = Lazy::new(TagGenerator::for_process);

/// Produces tags that are unique for the lifetime of the generator.
#[derive(Debug)]
pub struct TagGenerator {
    prefix: String,
    counter: AtomicU64,
}

impl TagGenerator {
    /// Creates a generator with an explicit prefix.
    #[must_use]
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            counter: AtomicU64::new(1),
        }
    }

    fn for_process() -> Self {
        let started = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |elapsed| elapsed.as_micros());
        Self::with_prefix(format!("{:x}-{started:x}", process::id()))
    }

    /// Returns the next tag.
    #[must_use]
    pub fn next_tag(&self) -> String {
        let id = self.counter.fetch_add(1, Ordering::Relaxed);
        format!("{}-{id}", self.prefix)
    }
}

/// Returns a process-unique tag.
#[must_use]
pub fn fresh_tag() -> String {
    PROCESS_TAGS.next_tag()
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn tags_do_not_repeat() {
        let tags: HashSet<String> = (0..256).map(|_| fresh_tag()).collect();
        assert_eq!(tags.len(), 256);
    }

    #[test]
    fn prefix_is_kept() {
        let generator = TagGenerator::with_prefix("test");
        assert_eq!(generator.next_tag(), "test-1");
        assert_eq!(generator.next_tag(), "test-2");
    }
}
