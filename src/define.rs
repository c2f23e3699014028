//! Core data model shared by the planner, the orchestrator and the runners.
//!
//! A [`Batch`] is the abstract unit authored by test writers: a group name,
//! a possibly under-specified [`OsRequirement`], the Go test packages to run
//! and an optional shared stack. The planner pairs batches with concrete
//! [`OsProfile`]s; the orchestrator then resolves the [`Build`] artifacts that
//! must be shipped to each instance.
//!
//! Batch definitions are loaded from a JSON document:
//!
//! ```json
//! [
//!   {
//!     "group": "default",
//!     "os": { "type": "linux", "arch": "amd64", "distro": "ubuntu" },
//!     "stack": { "version": "8.10.0" },
//!     "tests": [
//!       { "name": "testing/integration", "tests": [{ "name": "TestInstall", "stack": true }] }
//!     ]
//!   }
//! ]
//! ```

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Operating system family of a target environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OsType {
    Linux,
    Windows,
    Darwin,
    Kubernetes,
}

impl OsType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OsType::Linux => "linux",
            OsType::Windows => "windows",
            OsType::Darwin => "darwin",
            OsType::Kubernetes => "kubernetes",
        }
    }
}

impl fmt::Display for OsType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OsType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "linux" => Ok(OsType::Linux),
            "windows" => Ok(OsType::Windows),
            "darwin" => Ok(OsType::Darwin),
            "kubernetes" => Ok(OsType::Kubernetes),
            other => Err(format!("unknown OS type: {}", other)),
        }
    }
}

/// CPU architecture of a target environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Arch {
    Amd64,
    Arm64,
}

impl Arch {
    pub fn as_str(&self) -> &'static str {
        match self {
            Arch::Amd64 => "amd64",
            Arch::Arm64 => "arm64",
        }
    }

    /// Architecture of the machine running the orchestrator, if it is one we
    /// know how to target.
    pub fn host() -> Option<Arch> {
        match std::env::consts::ARCH {
            "x86_64" => Some(Arch::Amd64),
            "aarch64" => Some(Arch::Arm64),
            _ => None,
        }
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Arch {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "amd64" => Ok(Arch::Amd64),
            "arm64" => Ok(Arch::Arm64),
            other => Err(format!("unknown architecture: {}", other)),
        }
    }
}

/// The OS a batch asks for. Unset fields match any concrete value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OsRequirement {
    #[serde(rename = "type")]
    pub os_type: OsType,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arch: Option<Arch>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    /// Only meaningful for Linux.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub distro: Option<String>,

    /// Only meaningful for Kubernetes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub docker_variant: Option<String>,
}

impl OsRequirement {
    pub fn new(os_type: OsType) -> Self {
        Self {
            os_type,
            arch: None,
            version: None,
            distro: None,
            docker_variant: None,
        }
    }
}

/// Prints only the fields the batch set; unset fields in between show as `*`.
impl fmt::Display for OsRequirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = vec![
            self.arch.map(|a| a.to_string()),
            self.distro.clone(),
            self.version.clone(),
            self.docker_variant.clone(),
        ];
        while matches!(parts.last(), Some(None)) {
            parts.pop();
        }
        write!(f, "{}", self.os_type)?;
        for part in parts {
            write!(f, "/{}", part.as_deref().unwrap_or("*"))?;
        }
        Ok(())
    }
}

/// A fully specified class of target environment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OsProfile {
    #[serde(rename = "type")]
    pub os_type: OsType,
    pub arch: Arch,
    #[serde(default)]
    pub distro: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub docker_variant: String,
}

impl fmt::Display for OsProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.os_type, self.arch)?;
        if !self.distro.is_empty() {
            write!(f, "/{}", self.distro)?;
        }
        if !self.version.is_empty() {
            write!(f, "/{}", self.version)?;
        }
        if !self.docker_variant.is_empty() {
            write!(f, "/{}", self.docker_variant)?;
        }
        Ok(())
    }
}

/// Shared stack a batch depends on. An empty version means the run's
/// default stack version.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackRequirement {
    #[serde(default)]
    pub version: String,
}

/// A single Go test function.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchPackageTest {
    pub name: String,

    /// Whether this test needs the batch's shared stack.
    #[serde(default)]
    pub stack: bool,
}

/// A Go package and the tests selected from it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchPackageTests {
    pub name: String,
    #[serde(default)]
    pub tests: Vec<BatchPackageTest>,
}

/// An abstract test batch as authored by test writers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Batch {
    pub group: String,
    pub os: OsRequirement,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<StackRequirement>,

    #[serde(default)]
    pub tests: Vec<BatchPackageTests>,

    /// Tests that must run with elevated privileges.
    #[serde(default)]
    pub sudo_tests: Vec<BatchPackageTests>,
}

/// Loads batch definitions from a JSON file.
pub fn load_batches(path: &Path) -> Result<Vec<Batch>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read batches file: {}", path.display()))?;
    let batches = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse batches file: {}", path.display()))?;
    Ok(batches)
}

/// Package formats a build can be shipped as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PackageFormat {
    TarGz,
    Zip,
    Rpm,
    Deb,
}

impl PackageFormat {
    pub const ALL: [PackageFormat; 4] = [
        PackageFormat::TarGz,
        PackageFormat::Zip,
        PackageFormat::Rpm,
        PackageFormat::Deb,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PackageFormat::TarGz => "targz",
            PackageFormat::Zip => "zip",
            PackageFormat::Rpm => "rpm",
            PackageFormat::Deb => "deb",
        }
    }
}

/// File name suffix of a packaged build, if that combination is produced.
pub fn package_suffix(os_type: OsType, arch: Arch, format: PackageFormat) -> Option<&'static str> {
    use PackageFormat::*;
    match (os_type, arch, format) {
        (OsType::Linux, Arch::Amd64, TarGz) => Some("linux-x86_64.tar.gz"),
        (OsType::Linux, Arch::Arm64, TarGz) => Some("linux-arm64.tar.gz"),
        (OsType::Linux, Arch::Amd64, Deb) => Some("amd64.deb"),
        (OsType::Linux, Arch::Arm64, Deb) => Some("arm64.deb"),
        (OsType::Linux, Arch::Amd64, Rpm) => Some("x86_64.rpm"),
        (OsType::Linux, Arch::Arm64, Rpm) => Some("aarch64.rpm"),
        (OsType::Windows, Arch::Amd64, Zip) => Some("windows-x86_64.zip"),
        (OsType::Darwin, Arch::Amd64, TarGz) => Some("darwin-x86_64.tar.gz"),
        (OsType::Darwin, Arch::Arm64, TarGz) => Some("darwin-aarch64.tar.gz"),
        _ => None,
    }
}

/// A packaged build artifact and its checksum file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Build {
    pub version: String,
    pub os_type: OsType,
    pub arch: Arch,
    pub path: PathBuf,
    pub sha512_path: PathBuf,
}

/// Resolves the build artifacts that must exist for one target.
///
/// `packages` restricts the formats (e.g. `["targz", "deb"]`); when none of
/// the requested formats is known every format is considered. Binaries whose
/// name ends in `beat` only ship archives.
pub fn builds_for(
    build_dir: &Path,
    binary_name: &str,
    version: &str,
    os_type: OsType,
    arch: Arch,
    packages: &[String],
) -> Vec<Build> {
    let mut formats: Vec<PackageFormat> = PackageFormat::ALL
        .into_iter()
        .filter(|f| packages.iter().any(|p| p == f.as_str()))
        .collect();
    if formats.is_empty() {
        formats = PackageFormat::ALL.to_vec();
    }
    if binary_name.ends_with("beat") {
        formats.retain(|f| matches!(f, PackageFormat::TarGz | PackageFormat::Zip));
    }

    formats
        .into_iter()
        .filter_map(|format| package_suffix(os_type, arch, format))
        .map(|suffix| {
            let path = build_dir.join(format!("{}-{}-{}", binary_name, version, suffix));
            let mut sha = path.clone().into_os_string();
            sha.push(".sha512");
            Build {
                version: version.to_string(),
                os_type,
                arch,
                path,
                sha512_path: PathBuf::from(sha),
            }
        })
        .collect()
}
