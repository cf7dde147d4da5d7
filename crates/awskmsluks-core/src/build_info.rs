//! Immutable build metadata handed to the version printer.

use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildInfo {
    pub version: String,
    pub git_hash: Option<String>,
    pub build_time: Option<String>,
}

impl BuildInfo {
    pub fn new(
        version: impl Into<String>,
        git_hash: Option<&str>,
        build_time: Option<&str>,
    ) -> Self {
        let clean = |value: Option<&str>| {
            value
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .map(str::to_string)
        };
        Self {
            version: version.into(),
            git_hash: clean(git_hash),
            build_time: clean(build_time),
        }
    }
}

impl fmt::Display for BuildInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Version: {}", self.version)?;
        writeln!(
            f,
            "Build hash: {}",
            self.git_hash.as_deref().unwrap_or("unknown")
        )?;
        write!(
            f,
            "Build time: {}",
            self.build_time.as_deref().unwrap_or("unknown")
        )
    }
}
