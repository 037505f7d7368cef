//! Include/exclude glob rules for directory transfers and archive extraction.

use std::path::Path;

use globset::{Glob, GlobSet, GlobSetBuilder};

use crate::error::{FsOpsError, FsOpsResult};

/// Compiled include and exclude sets. Exclusion wins; an empty include set
/// admits everything.
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    include: Option<GlobSet>,
    exclude: Option<GlobSet>,
}

impl RuleSet {
    /// Compile both pattern lists.
    ///
    /// # Errors
    ///
    /// Returns [`FsOpsError::InvalidInput`] for blank patterns and
    /// [`FsOpsError::Glob`] for patterns that fail to compile.
    pub fn new(include: &[String], exclude: &[String]) -> FsOpsResult<Self> {
        Ok(Self {
            include: build_globset(include, "include_patterns")?,
            exclude: build_globset(exclude, "exclude_patterns")?,
        })
    }

    /// Whether `relative` passes the rules.
    #[must_use]
    pub fn admits(&self, relative: &Path) -> bool {
        if self
            .exclude
            .as_ref()
            .is_some_and(|exclude| exclude.is_match(relative))
        {
            return false;
        }
        self.include
            .as_ref()
            .is_none_or(|include| include.is_match(relative))
    }

    /// Whether any rule is configured.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.include.is_none() && self.exclude.is_none()
    }
}

fn build_globset(patterns: &[String], field: &'static str) -> FsOpsResult<Option<GlobSet>> {
    if patterns.is_empty() {
        return Ok(None);
    }

    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        if pattern.trim().is_empty() {
            return Err(FsOpsError::InvalidInput {
                field,
                reason: "empty_pattern",
                value: Some(pattern.clone()),
            });
        }
        builder.add(
            Glob::new(pattern)
                .map_err(|source_err| FsOpsError::glob(field, pattern.clone(), source_err))?,
        );
    }
    Ok(Some(builder.build().map_err(|source_err| {
        FsOpsError::glob(field, "<set>".to_string(), source_err)
    })?))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn patterns(values: &[&str]) -> Vec<String> {
        values.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn exclude_wins_over_include() -> FsOpsResult<()> {
        let rules = RuleSet::new(&patterns(&["**/*.nc"]), &patterns(&["**/restart/**"]))?;
        assert!(rules.admits(Path::new("out/atm.nc")));
        assert!(!rules.admits(Path::new("out/restart/atm.nc")));
        assert!(!rules.admits(Path::new("out/log.txt")));
        Ok(())
    }

    #[test]
    fn empty_rules_admit_everything() -> FsOpsResult<()> {
        let rules = RuleSet::new(&[], &[])?;
        assert!(rules.is_empty());
        assert!(rules.admits(Path::new("anything/at/all")));

        let only_exclude = RuleSet::new(&[], &patterns(&["*.log"]))?;
        assert!(only_exclude.admits(Path::new("data.nc")));
        assert!(!only_exclude.admits(Path::new("run.log")));
        Ok(())
    }

    #[test]
    fn blank_and_broken_patterns_are_rejected() {
        assert!(matches!(
            RuleSet::new(&patterns(&[" "]), &[]),
            Err(FsOpsError::InvalidInput {
                field: "include_patterns",
                ..
            })
        ));
        assert!(matches!(
            RuleSet::new(&[], &patterns(&["[a-"])),
            Err(FsOpsError::Glob {
                field: "exclude_patterns",
                ..
            })
        ));
    }
}
