//! Kernel versioning contract.
//!
//! Workflows may declare version requirements in a `# @workflow` header; the
//! runtime refuses to execute a workflow whose `min_kernel_version` is not
//! compatible with the running kernel. Same-major is compatible by default.

use std::cmp::Ordering;
use std::fmt;

/// Version of the running kernel.
pub const KERNEL_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Compatibility status between a workflow and the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionCompatibility {
    Compatible,
    /// Works today but will break in a future kernel.
    Deprecated,
    Incompatible,
}

/// Semantic version (major.minor.patch, optional prerelease).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SemanticVersion {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
    pub prerelease: Option<String>,
}

impl SemanticVersion {
    /// Parse a version string like `1.2.3` or `1.2.3-beta.1`.
    pub fn parse(version: &str) -> Option<SemanticVersion> {
        let (core, prerelease) = match version.split_once('-') {
            Some((core, pre)) if !pre.is_empty() => (core, Some(pre.to_string())),
            Some(_) => return None,
            None => (version, None),
        };
        let mut parts = core.split('.');
        let major = parts.next()?.parse().ok()?;
        let minor = parts.next()?.parse().ok()?;
        let patch = parts.next()?.parse().ok()?;
        if parts.next().is_some() {
            return None;
        }
        Some(SemanticVersion {
            major,
            minor,
            patch,
            prerelease,
        })
    }

    /// Same-major versions are API-compatible; a major bump is breaking.
    pub fn is_compatible_with(&self, other: &SemanticVersion) -> bool {
        self.major == other.major
    }
}

impl fmt::Display for SemanticVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)?;
        if let Some(pre) = &self.prerelease {
            write!(f, "-{}", pre)?;
        }
        Ok(())
    }
}

impl PartialOrd for SemanticVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SemanticVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        self.major
            .cmp(&other.major)
            .then(self.minor.cmp(&other.minor))
            .then(self.patch.cmp(&other.patch))
            // A prerelease sorts below the corresponding release.
            .then_with(|| match (&self.prerelease, &other.prerelease) {
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (a, b) => a.cmp(b),
            })
    }
}

/// Version requirements declared by a workflow header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkflowMetadata {
    pub name: String,
    pub version: String,
    pub min_kernel_version: String,
    pub max_kernel_version: Option<String>,
    pub deprecated_in: Option<String>,
}

impl WorkflowMetadata {
    /// Check this workflow against a kernel version.
    pub fn check_compatibility(&self, kernel_version: &str) -> (VersionCompatibility, String) {
        let kernel = match SemanticVersion::parse(kernel_version) {
            Some(v) => v,
            None => {
                return (
                    VersionCompatibility::Incompatible,
                    format!("invalid kernel version: {}", kernel_version),
                )
            }
        };
        let min = match SemanticVersion::parse(&self.min_kernel_version) {
            Some(v) => v,
            None => {
                return (
                    VersionCompatibility::Incompatible,
                    format!("invalid min_kernel_version: {}", self.min_kernel_version),
                )
            }
        };

        if kernel < min {
            return (
                VersionCompatibility::Incompatible,
                format!(
                    "workflow requires kernel >= {}, got {}",
                    self.min_kernel_version, kernel_version
                ),
            );
        }

        if let Some(max_str) = &self.max_kernel_version {
            if let Some(max) = SemanticVersion::parse(max_str) {
                if kernel > max {
                    return (
                        VersionCompatibility::Incompatible,
                        format!("workflow requires kernel <= {}, got {}", max_str, kernel_version),
                    );
                }
            }
        }

        if !kernel.is_compatible_with(&min) {
            return (
                VersionCompatibility::Incompatible,
                format!(
                    "workflow built for kernel {}.x, running on {}.x",
                    min.major, kernel.major
                ),
            );
        }

        if let Some(deprecated_str) = &self.deprecated_in {
            if let Some(deprecated) = SemanticVersion::parse(deprecated_str) {
                if kernel >= deprecated {
                    return (
                        VersionCompatibility::Deprecated,
                        format!("workflow is deprecated as of kernel {}", deprecated_str),
                    );
                }
            }
        }

        (VersionCompatibility::Compatible, "OK".to_string())
    }
}

/// Extract workflow metadata from leading header comments.
///
/// Expected form, within the first 20 lines:
///
/// ```text
/// # @workflow name: my-workflow
/// # @workflow version: 1.0.0
/// # @workflow min_kernel_version: 0.2.0
/// ```
///
/// Returns `None` unless name, version and min_kernel_version are all
/// present.
pub fn parse_workflow_header(code: &str) -> Option<WorkflowMetadata> {
    let mut name = None;
    let mut version = None;
    let mut min_kernel_version = None;
    let mut max_kernel_version = None;
    let mut deprecated_in = None;

    for line in code.lines().take(20) {
        let line = line.trim();
        let Some(rest) = line.strip_prefix('#') else {
            continue;
        };
        let Some(rest) = rest.trim_start().strip_prefix("@workflow") else {
            continue;
        };
        let Some((key, value)) = rest.split_once(':') else {
            continue;
        };
        let key = key.trim();
        let value = value.trim().to_string();
        match key {
            "name" => name = Some(value),
            "version" => version = Some(value),
            "min_kernel_version" => min_kernel_version = Some(value),
            "max_kernel_version" => max_kernel_version = Some(value),
            "deprecated_in" => deprecated_in = Some(value),
            _ => {}
        }
    }

    Some(WorkflowMetadata {
        name: name?,
        version: version?,
        min_kernel_version: min_kernel_version?,
        max_kernel_version,
        deprecated_in,
    })
}
