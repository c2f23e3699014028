//! The OS profiles this orchestrator knows how to run.
//!
//! Order matters: when matrix mode is off the planner picks the first profile
//! matching a batch, so the most wanted profile of each family comes first.

use crate::define::{Arch, OsProfile, OsType};
use crate::runner::RunnerKind;

/// An [`OsProfile`] together with the runner that executes tests on it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupportedOs {
    pub profile: OsProfile,
    pub runner: RunnerKind,
}

const UBUNTU_VERSIONS: [&str; 3] = ["24.04", "22.04", "20.04"];
const RHEL_VERSIONS: [&str; 1] = ["8"];
const WINDOWS_VERSIONS: [&str; 6] = [
    "2022",
    "2022-core",
    "2019",
    "2019-core",
    "2016",
    "2016-core",
];
const KUBERNETES_VERSIONS: [&str; 5] = ["1.31.0", "1.30.4", "1.29.8", "1.28.13", "1.27.16"];
const KUBERNETES_VARIANTS: [&str; 6] = [
    "basic",
    "ubi",
    "wolfi",
    "complete",
    "complete-wolfi",
    "service",
];

fn linux(arch: Arch, distro: &str, version: &str, runner: RunnerKind) -> SupportedOs {
    SupportedOs {
        profile: OsProfile {
            os_type: OsType::Linux,
            arch,
            distro: distro.to_string(),
            version: version.to_string(),
            docker_variant: String::new(),
        },
        runner,
    }
}

/// Returns the built-in profile table, most wanted first.
pub fn supported() -> Vec<SupportedOs> {
    let mut out = Vec::new();

    for arch in [Arch::Amd64, Arch::Arm64] {
        for version in UBUNTU_VERSIONS {
            out.push(linux(arch, "ubuntu", version, RunnerKind::Debian));
        }
    }
    for version in RHEL_VERSIONS {
        out.push(linux(Arch::Amd64, "rhel", version, RunnerKind::Rhel));
    }
    for version in WINDOWS_VERSIONS {
        out.push(SupportedOs {
            profile: OsProfile {
                os_type: OsType::Windows,
                arch: Arch::Amd64,
                distro: String::new(),
                version: version.to_string(),
                docker_variant: String::new(),
            },
            runner: RunnerKind::Windows,
        });
    }
    for arch in [Arch::Amd64, Arch::Arm64] {
        for version in KUBERNETES_VERSIONS {
            for variant in KUBERNETES_VARIANTS {
                out.push(SupportedOs {
                    profile: OsProfile {
                        os_type: OsType::Kubernetes,
                        arch,
                        distro: String::new(),
                        version: version.to_string(),
                        docker_variant: variant.to_string(),
                    },
                    runner: RunnerKind::Kubernetes,
                });
            }
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ubuntu_amd64_is_most_wanted() {
        let table = supported();
        assert_eq!(table[0].profile.os_type, OsType::Linux);
        assert_eq!(table[0].profile.arch, Arch::Amd64);
        assert_eq!(table[0].profile.version, "24.04");
    }

    #[test]
    fn test_kubernetes_profiles_expand_variants() {
        let count = supported()
            .iter()
            .filter(|s| s.profile.os_type == OsType::Kubernetes)
            .count();
        assert_eq!(count, 2 * KUBERNETES_VERSIONS.len() * KUBERNETES_VARIANTS.len());
    }
}
