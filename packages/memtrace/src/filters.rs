use crate::error::ConfigError;
use crate::traceback::Frame;

/// Upper bound on `*` wildcards in one pattern after collapsing.
///
/// The wildcard match backtracks per joker; the cap bounds its worst case.
pub const MAX_JOKERS: usize = 100;

/// A recording filter: a wildcard filename pattern, an optional line number
/// and a traceback scope.
///
/// Filters are immutable once constructed. The pattern is normalized at
/// construction: consecutive `*` jokers are collapsed into one, and a
/// compiled-artifact suffix (`.pyc`/`.pyo`) is rewritten to its source form
/// (`.py`), which the match also applies to filenames, so a pattern written
/// against sources matches their compiled counterparts too.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Filter {
    include: bool,
    pattern: Box<str>,
    lineno: Option<u32>,
    all_frames: bool,
}

impl Filter {
    /// Creates an include filter: allocations pass when they match it.
    pub fn include(pattern: &str) -> Result<Self, ConfigError> {
        Self::new(true, pattern)
    }

    /// Creates an exclude filter: allocations are dropped when they match it.
    pub fn exclude(pattern: &str) -> Result<Self, ConfigError> {
        Self::new(false, pattern)
    }

    fn new(include: bool, pattern: &str) -> Result<Self, ConfigError> {
        Ok(Self {
            include,
            pattern: normalize_pattern(pattern)?,
            lineno: None,
            all_frames: false,
        })
    }

    /// Restricts the filter to one line number; by default any line matches.
    #[must_use]
    pub fn with_lineno(mut self, lineno: u32) -> Self {
        self.lineno = Some(lineno);
        self
    }

    /// Evaluates the filter against every frame of a traceback instead of
    /// only the innermost one.
    #[must_use]
    pub fn with_all_frames(mut self) -> Self {
        self.all_frames = true;
        self
    }

    /// Whether this is an include filter.
    #[must_use]
    #[cfg_attr(test, mutants::skip)] // Can be mutated into a lying accessor.
    pub fn is_include(&self) -> bool {
        self.include
    }

    /// The normalized pattern.
    #[must_use]
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// The line-number restriction, if any.
    #[must_use]
    #[cfg_attr(test, mutants::skip)] // Can be mutated into a lying accessor.
    pub fn lineno(&self) -> Option<u32> {
        self.lineno
    }

    /// Whether the filter is evaluated against every frame of a traceback.
    #[must_use]
    #[cfg_attr(test, mutants::skip)] // Can be mutated into a lying accessor.
    pub fn scans_all_frames(&self) -> bool {
        self.all_frames
    }

    /// Whether one (filename, lineno) pair matches the filter.
    #[must_use]
    pub fn matches_frame(&self, filename: &str, lineno: u32) -> bool {
        if !joker_match(self.pattern.as_bytes(), source_filename(filename).as_bytes()) {
            return false;
        }

        self.lineno.is_none_or(|wanted| wanted == lineno)
    }

    /// Whether a traceback passes this filter.
    ///
    /// An include filter passes on the first matching frame; an exclude
    /// filter fails on the first matching frame and passes otherwise. An
    /// empty frame slice matches nothing, so it fails every include filter
    /// and passes every exclude filter regardless of the pattern.
    #[must_use]
    pub fn passes(&self, frames: &[Frame]) -> bool {
        let matched = if self.all_frames {
            frames
                .iter()
                .any(|frame| self.matches_frame(&frame.filename, frame.lineno))
        } else {
            frames
                .first()
                .is_some_and(|frame| self.matches_frame(&frame.filename, frame.lineno))
        };

        if self.include { matched } else { !matched }
    }
}

/// Whether the filter set allows recording a traceback.
///
/// The traceback must pass at least one include filter (vacuously true when
/// there are none) and every exclude filter.
pub(crate) fn allows(filters: &[Filter], frames: &[Frame]) -> bool {
    let mut any_include = false;
    let mut included = false;

    for filter in filters {
        if filter.include {
            any_include = true;
            if !included && filter.passes(frames) {
                included = true;
            }
        } else if !filter.passes(frames) {
            return false;
        }
    }

    !any_include || included
}

/// Maps a compiled-artifact filename to its source form.
fn source_filename(filename: &str) -> &str {
    if filename.ends_with(".pyc") || filename.ends_with(".pyo") {
        &filename[..filename.len() - 1]
    } else {
        filename
    }
}

/// Collapses consecutive jokers, rewrites a compiled-artifact suffix to its
/// source form and enforces the joker cap.
fn normalize_pattern(pattern: &str) -> Result<Box<str>, ConfigError> {
    let mut normalized = String::with_capacity(pattern.len());
    let mut jokers = 0_usize;

    for ch in pattern.chars() {
        if ch == '*' {
            if normalized.ends_with('*') {
                continue;
            }
            jokers += 1;
            if jokers > MAX_JOKERS {
                return Err(ConfigError::TooManyJokers);
            }
        }
        normalized.push(ch);
    }

    if normalized.ends_with(".pyc") || normalized.ends_with(".pyo") {
        normalized.truncate(normalized.len() - 1);
    }

    Ok(normalized.into_boxed_str())
}

/// Wildcard match where `*` matches any substring, including the empty one.
///
/// Two-cursor scan with backtracking to the most recent joker; at most one
/// live backtrack point, so the scan is linear in `text` per joker.
fn joker_match(pattern: &[u8], text: &[u8]) -> bool {
    let mut p = 0;
    let mut t = 0;
    let mut joker: Option<usize> = None;
    let mut mark = 0;

    while t < text.len() {
        if p < pattern.len() && pattern[p] == b'*' {
            joker = Some(p);
            mark = t;
            p += 1;
        } else if p < pattern.len() && pattern[p] == text[t] {
            p += 1;
            t += 1;
        } else if let Some(joker_at) = joker {
            // Let the previous joker swallow one more byte and retry.
            p = joker_at + 1;
            mark += 1;
            t = mark;
        } else {
            return false;
        }
    }

    while p < pattern.len() && pattern[p] == b'*' {
        p += 1;
    }

    p == pattern.len()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    fn frame(filename: &str, lineno: u32) -> Frame {
        Frame {
            filename: Arc::from(filename),
            lineno,
        }
    }

    #[test]
    fn joker_matches_any_substring() {
        let filter = Filter::include("*/foo.py").unwrap();

        assert!(filter.matches_frame("/a/b/foo.py", 1));
        assert!(filter.matches_frame("/foo.py", 1));
        assert!(!filter.matches_frame("/a/b/bar.py", 1));
        assert!(!filter.matches_frame("foo.py", 1));
    }

    #[test]
    fn compiled_suffix_is_equivalent_to_source() {
        let filter = Filter::include("*/foo.py").unwrap();
        assert!(filter.matches_frame("/a/b/foo.pyc", 1));
        assert!(filter.matches_frame("/a/b/foo.pyo", 1));

        // And the pattern side is normalized the same way.
        let filter = Filter::include("*/foo.pyc").unwrap();
        assert_eq!(filter.pattern(), "*/foo.py");
        assert!(filter.matches_frame("/a/b/foo.py", 1));
    }

    #[test]
    fn consecutive_jokers_collapse() {
        let collapsed = Filter::include("a**b").unwrap();
        let single = Filter::include("a*b").unwrap();
        assert_eq!(collapsed.pattern(), single.pattern());

        for text in ["ab", "axxxb", "a*b", "a", "abc"] {
            assert_eq!(
                collapsed.matches_frame(text, 1),
                single.matches_frame(text, 1),
                "divergence on {text:?}"
            );
        }
    }

    #[test]
    fn joker_cap_is_enforced() {
        let at_cap = "*x".repeat(MAX_JOKERS);
        assert!(Filter::include(&at_cap).is_ok());

        let over_cap = "*x".repeat(MAX_JOKERS + 1);
        assert_eq!(
            Filter::include(&over_cap).unwrap_err(),
            ConfigError::TooManyJokers
        );
    }

    #[test]
    fn lineno_restricts_the_match() {
        let filter = Filter::include("x.py").unwrap().with_lineno(10);

        assert!(filter.matches_frame("x.py", 10));
        assert!(!filter.matches_frame("x.py", 11));

        let any_line = Filter::include("x.py").unwrap();
        assert!(any_line.matches_frame("x.py", 11));
    }

    #[test]
    fn include_checks_only_the_top_frame_by_default() {
        let frames = [frame("inner.py", 1), frame("outer.py", 2)];

        assert!(Filter::include("inner.py").unwrap().passes(&frames));
        assert!(!Filter::include("outer.py").unwrap().passes(&frames));
        assert!(
            Filter::include("outer.py")
                .unwrap()
                .with_all_frames()
                .passes(&frames)
        );
    }

    #[test]
    fn exclude_polarity_is_inverted() {
        let frames = [frame("noise.py", 1)];

        assert!(!Filter::exclude("noise.py").unwrap().passes(&frames));
        assert!(Filter::exclude("other.py").unwrap().passes(&frames));
    }

    #[test]
    fn empty_filter_set_allows_everything() {
        assert!(allows(&[], &[frame("anything.py", 1)]));
    }

    #[test]
    fn include_and_exclude_combine() {
        let filters = [
            Filter::include("x.py").unwrap(),
            Filter::exclude("x.py").unwrap().with_lineno(10),
        ];

        assert!(!allows(&filters, &[frame("y.py", 10)]));
        assert!(!allows(&filters, &[frame("x.py", 10)]));
        assert!(allows(&filters, &[frame("x.py", 11)]));
    }

    #[test]
    fn any_matching_include_suffices() {
        let filters = [
            Filter::include("a.py").unwrap(),
            Filter::include("b.py").unwrap(),
        ];

        assert!(allows(&filters, &[frame("a.py", 1)]));
        assert!(allows(&filters, &[frame("b.py", 1)]));
        assert!(!allows(&filters, &[frame("c.py", 1)]));
    }

    #[test]
    fn missing_stack_is_unmatched_by_every_pattern() {
        // Even a match-everything wildcard does not match a traceback with
        // no frames.
        assert!(!Filter::include("*").unwrap().passes(&[]));
        assert!(Filter::exclude("*").unwrap().passes(&[]));
        assert!(!Filter::include("*").unwrap().with_all_frames().passes(&[]));

        assert!(!allows(&[Filter::include("*").unwrap()], &[]));
        assert!(allows(&[Filter::exclude("*").unwrap()], &[]));
        assert!(!allows(&[Filter::include("*.py").unwrap()], &[]));
    }
}
