//! Namespace filtering (spec.md §4.3).
//!
//! Filter specs are comma- or space-separated glob patterns, the same shape
//! the `debug` ecosystem convention uses: `*` matches any run of characters,
//! a leading `-` excludes instead of includes, and exclusions always win
//! over inclusions regardless of order. `percy:snapshot:*` matches
//! `percy:snapshot:login-page` but not `percy:snapshot`; a bare `*` matches
//! every namespace.

use regex::Regex;

/// Severity of a single log line. `Warn` and `Error` bypass namespace
/// filtering entirely — they're never silenced by `PERCY_DEBUG`, only by
/// [`LogLevel::Silent`] turning logging off altogether.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
    /// Not a real message level; the floor `PERCY_LOGLEVEL=silent` sets.
    Silent,
}

impl LogLevel {
    /// Parse the `PERCY_LOGLEVEL` convention (`debug`, `info`, `warn`,
    /// `error`, `silent`), defaulting to `Info` for anything unrecognized.
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "debug" => LogLevel::Debug,
            "warn" | "warning" => LogLevel::Warn,
            "error" => LogLevel::Error,
            "silent" | "off" | "none" => LogLevel::Silent,
            _ => LogLevel::Info,
        }
    }
}

/// A compiled `PERCY_DEBUG`-style namespace filter.
#[derive(Debug, Clone)]
pub struct NamespaceFilter {
    includes: Vec<Regex>,
    excludes: Vec<Regex>,
}

impl NamespaceFilter {
    /// The filter that matches nothing (debug/info namespaces silenced,
    /// the default when `PERCY_DEBUG` is unset).
    pub fn none() -> Self {
        Self {
            includes: Vec::new(),
            excludes: Vec::new(),
        }
    }

    /// The filter that matches every namespace.
    pub fn all() -> Self {
        Self::parse("*")
    }

    /// Compile a `PERCY_DEBUG`-style spec string.
    pub fn parse(spec: &str) -> Self {
        let mut includes = Vec::new();
        let mut excludes = Vec::new();

        for token in spec.split([',', ' ']).map(str::trim).filter(|s| !s.is_empty()) {
            let (negate, pattern) = match token.strip_prefix('-') {
                Some(rest) => (true, rest),
                None => (false, token),
            };
            let regex = Self::compile_glob(pattern);
            if negate {
                excludes.push(regex);
            } else {
                includes.push(regex);
            }
        }

        Self { includes, excludes }
    }

    /// Translate one glob token into an anchored regex, per spec.md §3:
    /// `*` expands to `.*?` and a trailing `:*` expands to `:?.*?` (the
    /// colon itself becomes optional), so `percy:snapshot:*` matches both
    /// `percy:snapshot` and `percy:snapshot:login-page`.
    fn compile_glob(pattern: &str) -> Regex {
        let chars: Vec<char> = pattern.chars().collect();
        let mut regex_str = String::from("^");
        let mut i = 0;
        while i < chars.len() {
            if chars[i] == ':' && chars.get(i + 1) == Some(&'*') {
                regex_str.push_str(":?.*?");
                i += 2;
            } else if chars[i] == '*' {
                regex_str.push_str(".*?");
                i += 1;
            } else {
                regex_str.push_str(&regex::escape(&chars[i].to_string()));
                i += 1;
            }
        }
        regex_str.push('$');
        Regex::new(&regex_str).expect("glob-derived pattern is always a valid regex")
    }

    /// Whether `namespace` is currently enabled for `debug`/`info` output.
    pub fn matches(&self, namespace: &str) -> bool {
        if self.excludes.iter().any(|re| re.is_match(namespace)) {
            return false;
        }
        self.includes.iter().any(|re| re.is_match(namespace))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_star_matches_everything() {
        let filter = NamespaceFilter::parse("*");
        assert!(filter.matches("percy:core"));
        assert!(filter.matches("anything"));
    }

    #[test]
    fn prefix_glob_scopes_to_children_and_the_bare_prefix_itself() {
        // spec.md §3: a trailing `:*` expands to `:?.*?` — the colon is
        // itself optional, so the bare prefix matches too.
        let filter = NamespaceFilter::parse("percy:snapshot:*");
        assert!(filter.matches("percy:snapshot:login-page"));
        assert!(filter.matches("percy:snapshot"));
        assert!(!filter.matches("percy:core"));
    }

    #[test]
    fn exclusion_wins_over_inclusion() {
        let filter = NamespaceFilter::parse("percy:*,-percy:internal:*");
        assert!(filter.matches("percy:snapshot"));
        assert!(!filter.matches("percy:internal:queue"));
    }

    #[test]
    fn unset_filter_matches_nothing() {
        let filter = NamespaceFilter::none();
        assert!(!filter.matches("percy:core"));
    }
}
