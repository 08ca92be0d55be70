// src/pkg/mod.rs

//! Package records and installation state
//!
//! One [`Package`] is one known variant of a package: one name x version x
//! architecture, from one repository list or from a destination's installed
//! set. Variants sharing a name and architecture form a conceptual group;
//! the database tracks which single variant of a group is installed.

pub mod parse;

use std::fmt;
use std::str::FromStr;

use crate::version::Version;

/// Desired state recorded in the status file (`Status:` first token)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Want {
    #[default]
    Unknown,
    Install,
    Deinstall,
    Purge,
}

impl Want {
    pub fn as_str(&self) -> &str {
        match self {
            Want::Unknown => "unknown",
            Want::Install => "install",
            Want::Deinstall => "deinstall",
            Want::Purge => "purge",
        }
    }
}

impl FromStr for Want {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "unknown" => Ok(Want::Unknown),
            "install" => Ok(Want::Install),
            "deinstall" => Ok(Want::Deinstall),
            "purge" => Ok(Want::Purge),
            _ => Err(format!("Invalid want state: {}", s)),
        }
    }
}

/// Actual installation state (`Status:` third token)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PkgStatus {
    #[default]
    NotInstalled,
    Unpacked,
    Installed,
    HalfInstalled,
    ConfigFiles,
}

impl PkgStatus {
    pub fn as_str(&self) -> &str {
        match self {
            PkgStatus::NotInstalled => "not-installed",
            PkgStatus::Unpacked => "unpacked",
            PkgStatus::Installed => "installed",
            PkgStatus::HalfInstalled => "half-installed",
            PkgStatus::ConfigFiles => "config-files",
        }
    }
}

impl FromStr for PkgStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "not-installed" => Ok(PkgStatus::NotInstalled),
            "unpacked" => Ok(PkgStatus::Unpacked),
            "installed" => Ok(PkgStatus::Installed),
            "half-installed" => Ok(PkgStatus::HalfInstalled),
            "config-files" => Ok(PkgStatus::ConfigFiles),
            _ => Err(format!("Invalid package status: {}", s)),
        }
    }
}

/// Status-file flag bits (`Status:` middle token, comma-joined)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Flags {
    /// Installed at explicit user request rather than as a dependency
    pub user: bool,
    /// Preferred over other variants of the same group
    pub prefer: bool,
    pub essential: bool,
    pub hold: bool,
}

impl Flags {
    pub fn render(&self) -> String {
        let mut parts = Vec::new();
        if self.hold {
            parts.push("hold");
        }
        if self.user {
            parts.push("user");
        }
        if self.prefer {
            parts.push("prefer");
        }
        if self.essential {
            parts.push("essential");
        }
        if parts.is_empty() {
            "ok".to_string()
        } else {
            parts.join(",")
        }
    }

    pub fn parse(s: &str) -> Flags {
        let mut flags = Flags::default();
        for tok in s.split(',') {
            match tok {
                "hold" => flags.hold = true,
                "user" => flags.user = true,
                "prefer" => flags.prefer = true,
                "essential" => flags.essential = true,
                // "ok" and anything unrecognized contribute no bits
                _ => {}
            }
        }
        flags
    }
}

/// A configuration file owned by an installed package
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conffile {
    pub path: String,
    pub md5sum: String,
}

/// One known package variant
#[derive(Debug, Clone, Default)]
pub struct Package {
    // identity
    pub name: String,
    pub architecture: String,
    pub version: Option<Version>,

    // metadata
    pub description: String,
    pub tags: String,
    pub section: String,
    pub priority: String,
    pub maintainer: String,
    pub source_pkg: String,
    pub size_kb: u64,
    pub installed_size_kb: u64,
    pub installed_time: u64,
    pub md5sum: String,
    pub sha256sum: String,
    /// Remote path relative to the source URL
    pub filename: String,
    /// Local path after download; empty until fetched
    pub local_filename: String,

    // relational fields, each an ordered list of opaque clause strings
    pub depends: Vec<String>,
    pub pre_depends: Vec<String>,
    pub recommends: Vec<String>,
    pub suggests: Vec<String>,
    pub conflicts: Vec<String>,
    pub provides: Vec<String>,
    pub replaces: Vec<String>,

    // state
    pub want: Want,
    pub status: PkgStatus,
    pub flags: Flags,
    pub auto_installed: bool,

    pub conffiles: Vec<Conffile>,
    /// Paths installed by this package, recorded at unpack time
    pub file_list: Vec<String>,

    // non-owning references into the engine configuration
    pub source: Option<String>,
    pub dest: Option<String>,
    /// Priority of the source's architecture entry, for candidate selection
    pub arch_priority: u32,
}

impl Package {
    pub fn new(name: impl Into<String>) -> Self {
        Package {
            name: name.into(),
            ..Default::default()
        }
    }

    /// `epoch:upstream-revision` rendering, or empty when no version parsed
    pub fn version_str(&self) -> String {
        self.version
            .as_ref()
            .map(|v| v.to_string())
            .unwrap_or_default()
    }

    pub fn is_installed(&self) -> bool {
        self.status == PkgStatus::Installed
    }

    /// Immutable copy of the public fields, for progress sinks and query
    /// callbacks; never exposes live record state
    pub fn snapshot(&self) -> PackageInfo {
        PackageInfo {
            name: self.name.clone(),
            version: self.version_str(),
            architecture: self.architecture.clone(),
            repository: self.source.clone().unwrap_or_default(),
            description: self.description.clone(),
            tags: self.tags.clone(),
            size_kb: self.size_kb,
            installed: self.is_installed(),
        }
    }
}

impl fmt::Display for Package {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}) [{}]", self.name, self.version_str(), self.architecture)
    }
}

/// Snapshot of a package's public fields
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageInfo {
    pub name: String,
    pub version: String,
    pub architecture: String,
    pub repository: String,
    pub description: String,
    pub tags: String,
    pub size_kb: u64,
    pub installed: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_want_roundtrip() {
        for want in [Want::Unknown, Want::Install, Want::Deinstall, Want::Purge] {
            assert_eq!(want.as_str().parse::<Want>().unwrap(), want);
        }
        assert!("frobnicate".parse::<Want>().is_err());
    }

    #[test]
    fn test_status_roundtrip() {
        for status in [
            PkgStatus::NotInstalled,
            PkgStatus::Unpacked,
            PkgStatus::Installed,
            PkgStatus::HalfInstalled,
            PkgStatus::ConfigFiles,
        ] {
            assert_eq!(status.as_str().parse::<PkgStatus>().unwrap(), status);
        }
    }

    #[test]
    fn test_flags_render() {
        assert_eq!(Flags::default().render(), "ok");
        let flags = Flags {
            user: true,
            prefer: true,
            ..Default::default()
        };
        assert_eq!(flags.render(), "user,prefer");
        assert_eq!(Flags::parse("user,prefer"), flags);
        assert_eq!(Flags::parse("ok"), Flags::default());
    }

    #[test]
    fn test_snapshot_is_a_copy() {
        let mut pkg = Package::new("busybox");
        pkg.version = Some("1.36.1-r2".parse().unwrap());
        pkg.architecture = "armv7".to_string();
        pkg.status = PkgStatus::Installed;
        let info = pkg.snapshot();

        pkg.status = PkgStatus::NotInstalled;
        pkg.name = "mutated".to_string();

        assert_eq!(info.name, "busybox");
        assert_eq!(info.version, "1.36.1-r2");
        assert!(info.installed);
    }
}
