//! Path exclusion for record tracking
//!
//! Names under system directories are never tracked: no record is created
//! and the call is treated exactly like an untracked resource.
//! Supports:
//! - The built-in system prefixes: `/etc/`, `/dev/`, `/usr/`, ...
//! - Extra prefixes: `exclude=/scratch/tmp/,/var/spool/`
//! - Prefix classes: `exclude=system`, `exclude=none`

use anyhow::{bail, Result};

/// Prefixes excluded by default
pub const SYSTEM_PREFIXES: &[&str] = &[
    "/etc/", "/dev/", "/usr/", "/bin/", "/boot/", "/lib/", "/opt/", "/sbin/", "/sys/", "/proc/",
];

/// Prefix-based exclusion policy, tested against the raw name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathFilter {
    prefixes: Vec<String>,
}

impl PathFilter {
    /// Exclude the system prefixes only
    pub fn system() -> Self {
        Self {
            prefixes: SYSTEM_PREFIXES.iter().map(|s| s.to_string()).collect(),
        }
    }

    /// Track everything
    pub fn none() -> Self {
        Self {
            prefixes: Vec::new(),
        }
    }

    /// System prefixes plus the given extra prefixes
    pub fn with_extra<I, S>(extra: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut filter = Self::system();
        for prefix in extra {
            filter.add_prefix(prefix);
        }
        filter
    }

    /// Parse an exclusion expression like "exclude=system,/scratch/tmp/"
    pub fn from_expr(expr: &str) -> Result<Self> {
        if let Some(spec) = expr.strip_prefix("exclude=") {
            Self::from_exclude_spec(spec)
        } else {
            bail!(
                "Invalid exclusion expression: {}. Expected format: exclude=SPEC",
                expr
            );
        }
    }

    /// Parse the part after "exclude="
    fn from_exclude_spec(spec: &str) -> Result<Self> {
        let mut filter = Self::none();

        for part in spec.split(',') {
            let part = part.trim();
            match part {
                "" | "none" => {}
                "system" => {
                    for prefix in SYSTEM_PREFIXES {
                        filter.add_prefix(*prefix);
                    }
                }
                prefix if prefix.starts_with('/') => filter.add_prefix(prefix),
                other => bail!("Exclusion prefix must be absolute: {}", other),
            }
        }

        Ok(filter)
    }

    /// Add a prefix; duplicates are ignored
    pub fn add_prefix(&mut self, prefix: impl Into<String>) {
        let prefix = prefix.into();
        if !self.prefixes.contains(&prefix) {
            self.prefixes.push(prefix);
        }
    }

    /// Check if a name must not be tracked
    pub fn is_excluded(&self, name: &str) -> bool {
        self.prefixes
            .iter()
            .any(|prefix| name.starts_with(prefix.as_str()))
    }

    pub fn prefixes(&self) -> &[String] {
        &self.prefixes
    }
}

impl Default for PathFilter {
    fn default() -> Self {
        Self::system()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_filter_excludes_system_dirs() {
        let filter = PathFilter::system();
        assert!(filter.is_excluded("/etc/passwd"));
        assert!(filter.is_excluded("/proc/self/maps"));
        assert!(filter.is_excluded("/usr/lib/libc.so.6"));
        assert!(!filter.is_excluded("/data/run1.dat"));
        assert!(!filter.is_excluded("relative/file"));
    }

    #[test]
    fn test_prefix_requires_trailing_component() {
        let filter = PathFilter::system();
        // "/etc/" does not match "/etcetera"
        assert!(!filter.is_excluded("/etcetera/file"));
        assert!(!filter.is_excluded("/dev"));
    }

    #[test]
    fn test_none_tracks_everything() {
        let filter = PathFilter::none();
        assert!(!filter.is_excluded("/etc/passwd"));
        assert!(filter.prefixes().is_empty());
    }

    #[test]
    fn test_with_extra_keeps_system() {
        let filter = PathFilter::with_extra(["/scratch/tmp/"]);
        assert!(filter.is_excluded("/scratch/tmp/x"));
        assert!(filter.is_excluded("/etc/hosts"));
        assert!(!filter.is_excluded("/scratch/keep/x"));
    }

    #[test]
    fn test_expr_system_and_prefixes() {
        let filter = PathFilter::from_expr("exclude=system, /var/spool/").unwrap();
        assert!(filter.is_excluded("/etc/hosts"));
        assert!(filter.is_excluded("/var/spool/mail"));
        assert!(!filter.is_excluded("/var/log/x"));
    }

    #[test]
    fn test_expr_none() {
        let filter = PathFilter::from_expr("exclude=none").unwrap();
        assert!(!filter.is_excluded("/etc/hosts"));
    }

    #[test]
    fn test_invalid_expression() {
        assert!(PathFilter::from_expr("include=/etc/").is_err());
        assert!(PathFilter::from_expr("exclude=relative/").is_err());
    }

    #[test]
    fn test_duplicate_prefixes_ignored() {
        let mut filter = PathFilter::system();
        let before = filter.prefixes().len();
        filter.add_prefix("/etc/");
        assert_eq!(filter.prefixes().len(), before);
    }
}
