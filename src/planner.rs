//! Batch planning: pairing abstract batches with concrete OS profiles.
//!
//! ```text
//!   Vec<Batch>  ──► single-test narrowing ──► group filter
//!                                                  │
//!                                                  ▼
//!                              profile matching (requirement ∧ platform filters)
//!                                                  │
//!                     ┌────────────────────────────┼──────────────────────┐
//!                     ▼                            ▼                      ▼
//!              no match: Skip batch      matrix off: first match   matrix on: all matches
//!                     │                            │                      │
//!                     └────────────────────────────┴──────────────────────┘
//!                                                  ▼
//!                                          Vec<OsBatch> (with IDs)
//! ```
//!
//! The [`OsBatch`] ID is the correlation key against the state file and the
//! provisioners, so [`batch_id`] is a pure function of the profile fields and
//! the batch group.

pub mod profiles;

use std::str::FromStr;

use crate::define::{Arch, Batch, BatchPackageTests, OsProfile, OsRequirement, OsType};
use crate::runner::RunnerKind;

pub use profiles::{SupportedOs, supported};

/// Longest ID accepted by the cloud provisioner for instance names.
pub const MAX_ID_LEN: usize = 63;

/// Result type for planning operations.
pub type PlanResult<T> = Result<T, PlanError>;

/// Errors raised while planning batches. All of them are fatal for the run.
#[derive(Debug, thiserror::Error)]
pub enum PlanError {
    /// A platform filter string could not be parsed.
    #[error("invalid platform '{0}': {1}")]
    InvalidPlatform(String, String),

    /// The single test to run does not exist in any batch.
    #[error("test not found in any batch: {0}")]
    TestNotFound(String),
}

/// A concrete planning unit: one batch paired with one OS profile.
#[derive(Debug, Clone, PartialEq)]
pub struct OsBatch {
    pub id: String,

    /// For skipped batches this only seeds the ID: unset requirement
    /// fields are filled with placeholders. Print `batch.os` instead.
    pub profile: OsProfile,

    /// Runner able to execute on `profile`. `None` for skipped batches.
    pub runner: Option<RunnerKind>,

    pub batch: Batch,

    /// No supported profile matched the batch's requirement.
    pub skip: bool,
}

/// A `--platforms` entry restricting which profiles may be used.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlatformFilter {
    pub os_type: OsType,
    pub arch: Option<Arch>,
    pub distro: Option<String>,
    pub version: Option<String>,
    pub docker_variant: Option<String>,
}

/// Parses `type[/arch[/distro|version[/version|variant]]]`.
///
/// The four-part form is only valid for `linux` (distro then version) and
/// `kubernetes` (version then variant).
pub fn parse_platform(s: &str) -> PlanResult<PlatformFilter> {
    let invalid = |msg: &str| PlanError::InvalidPlatform(s.to_string(), msg.to_string());
    let parts: Vec<&str> = s.split('/').collect();
    if parts.is_empty() || parts.len() > 4 || parts.iter().any(|p| p.is_empty()) {
        return Err(invalid("expected type[/arch[/distro|version[/version|variant]]]"));
    }

    let os_type = OsType::from_str(parts[0]).map_err(|e| invalid(&e))?;
    let mut filter = PlatformFilter {
        os_type,
        arch: None,
        distro: None,
        version: None,
        docker_variant: None,
    };
    if let Some(arch) = parts.get(1) {
        filter.arch = Some(Arch::from_str(arch).map_err(|e| invalid(&e))?);
    }
    match (os_type, parts.len()) {
        (_, 1) | (_, 2) => {}
        (OsType::Linux, n) => {
            filter.distro = Some(parts[2].to_string());
            if n == 4 {
                filter.version = Some(parts[3].to_string());
            }
        }
        (OsType::Kubernetes, n) => {
            filter.version = Some(parts[2].to_string());
            if n == 4 {
                filter.docker_variant = Some(parts[3].to_string());
            }
        }
        (_, 3) => filter.version = Some(parts[2].to_string()),
        (other, _) => {
            return Err(invalid(&format!(
                "four-part form is not supported for {}",
                other
            )));
        }
    }
    Ok(filter)
}

/// Filters applied while planning.
#[derive(Debug, Clone, Default)]
pub struct PlanOptions {
    pub platforms: Vec<PlatformFilter>,
    pub groups: Vec<String>,
    pub matrix: bool,
    pub single_test: Option<String>,
}

/// Expands `batches` against `supported` into concrete planning units.
pub fn create_batches(
    batches: &[Batch],
    supported: &[SupportedOs],
    opts: &PlanOptions,
) -> PlanResult<Vec<OsBatch>> {
    let narrowed;
    let batches = match opts.single_test.as_deref().filter(|t| !t.is_empty()) {
        Some(test) => {
            narrowed = filter_single_test(batches, test)?;
            &narrowed[..]
        }
        None => batches,
    };

    let mut out = Vec::new();
    for batch in batches {
        if !opts.groups.is_empty() && !opts.groups.iter().any(|g| *g == batch.group) {
            continue;
        }
        out.extend(plan_batch(batch, supported, opts));
    }
    Ok(out)
}

fn plan_batch(batch: &Batch, supported: &[SupportedOs], opts: &PlanOptions) -> Vec<OsBatch> {
    let matches: Vec<&SupportedOs> = supported
        .iter()
        .filter(|s| os_match(&s.profile, &batch.os))
        .filter(|s| allowed_by_platforms(&s.profile, &opts.platforms))
        .collect();

    if matches.is_empty() {
        let profile = OsProfile {
            os_type: batch.os.os_type,
            arch: batch.os.arch.unwrap_or(Arch::Amd64),
            distro: batch
                .os
                .distro
                .clone()
                .unwrap_or_else(|| "unknown".to_string()),
            version: batch
                .os
                .version
                .clone()
                .unwrap_or_else(|| "unknown".to_string()),
            docker_variant: batch.os.docker_variant.clone().unwrap_or_default(),
        };
        return vec![OsBatch {
            id: batch_id(&profile, &batch.group),
            profile,
            runner: None,
            batch: batch.clone(),
            skip: true,
        }];
    }

    let take = if opts.matrix { matches.len() } else { 1 };
    matches
        .into_iter()
        .take(take)
        .map(|s| OsBatch {
            id: batch_id(&s.profile, &batch.group),
            profile: s.profile.clone(),
            runner: Some(s.runner),
            batch: batch.clone(),
            skip: false,
        })
        .collect()
}

/// Partial match: unset requirement fields match anything.
fn os_match(specific: &OsProfile, req: &OsRequirement) -> bool {
    if specific.os_type != req.os_type {
        return false;
    }
    if req.arch.is_some_and(|a| a != specific.arch) {
        return false;
    }
    if specific.os_type == OsType::Linux
        && req.distro.as_ref().is_some_and(|d| *d != specific.distro)
    {
        return false;
    }
    if req.version.as_ref().is_some_and(|v| *v != specific.version) {
        return false;
    }
    if specific.os_type == OsType::Kubernetes
        && req
            .docker_variant
            .as_ref()
            .is_some_and(|v| *v != specific.docker_variant)
    {
        return false;
    }
    true
}

fn allowed_by_platforms(profile: &OsProfile, platforms: &[PlatformFilter]) -> bool {
    platforms.is_empty() || platforms.iter().any(|p| allowed_by_platform(profile, p))
}

fn allowed_by_platform(profile: &OsProfile, platform: &PlatformFilter) -> bool {
    if profile.os_type != platform.os_type {
        return false;
    }
    let Some(arch) = platform.arch else {
        return true;
    };
    if profile.arch != arch {
        return false;
    }
    let eq = |want: &Option<String>, have: &str| want.as_deref().is_none_or(|w| w == have);
    match platform.os_type {
        OsType::Linux => {
            eq(&platform.distro, &profile.distro) && eq(&platform.version, &profile.version)
        }
        OsType::Kubernetes => {
            eq(&platform.version, &profile.version)
                && eq(&platform.docker_variant, &profile.docker_variant)
        }
        _ => eq(&platform.version, &profile.version),
    }
}

/// Narrows every batch to the single named test, dropping batches without it.
fn filter_single_test(batches: &[Batch], test: &str) -> PlanResult<Vec<Batch>> {
    let filtered: Vec<Batch> = batches
        .iter()
        .filter_map(|b| narrow_batch(b, test))
        .collect();
    if filtered.is_empty() {
        return Err(PlanError::TestNotFound(test.to_string()));
    }
    Ok(filtered)
}

fn narrow_batch(batch: &Batch, test: &str) -> Option<Batch> {
    let find = |packages: &[BatchPackageTests]| {
        packages.iter().find_map(|pkg| {
            pkg.tests.iter().find(|t| t.name == test).map(|t| {
                (
                    BatchPackageTests {
                        name: pkg.name.clone(),
                        tests: vec![t.clone()],
                    },
                    t.stack,
                )
            })
        })
    };

    let mut narrowed = batch.clone();
    if let Some((pkg, needs_stack)) = find(&batch.tests) {
        narrowed.tests = vec![pkg];
        narrowed.sudo_tests.clear();
        if !needs_stack {
            narrowed.stack = None;
        }
        return Some(narrowed);
    }
    if let Some((pkg, needs_stack)) = find(&batch.sudo_tests) {
        narrowed.tests.clear();
        narrowed.sudo_tests = vec![pkg];
        if !needs_stack {
            narrowed.stack = None;
        }
        return Some(narrowed);
    }
    None
}

/// Derives the planning unit ID from the profile and the batch group.
///
/// IDs longer than [`MAX_ID_LEN`] keep their first 30 characters followed by
/// `-` and the hex MD5 of the full ID. The result is always lowercase.
pub fn batch_id(profile: &OsProfile, group: &str) -> String {
    let mut id = format!("{}-{}", profile.os_type, profile.arch);
    if profile.os_type == OsType::Linux {
        id.push('-');
        id.push_str(&profile.distro);
    }
    if !profile.version.is_empty() {
        id.push('-');
        id.push_str(&profile.version.replace('.', ""));
    }
    if profile.os_type == OsType::Kubernetes && !profile.docker_variant.is_empty() {
        id.push('-');
        id.push_str(&profile.docker_variant);
    }
    id.push('-');
    id.push_str(&group.replace('.', ""));
    shorten_id(&id)
}

/// Bounds an ID to [`MAX_ID_LEN`] characters.
pub fn shorten_id(id: &str) -> String {
    if id.chars().count() <= MAX_ID_LEN {
        return id.to_lowercase();
    }
    let hash = format!("{:x}", md5::compute(id.as_bytes()));
    let keep = MAX_ID_LEN - hash.len() - 1;
    let prefix: String = id.chars().take(keep).collect();
    format!("{}-{}", prefix, hash).to_lowercase()
}

/// Drops planning units the selected instance provisioner cannot host.
pub fn filter_supported<F>(batches: Vec<OsBatch>, provisioner: &str, supported: F) -> Vec<OsBatch>
where
    F: Fn(&OsProfile) -> bool,
{
    batches
        .into_iter()
        .filter(|b| {
            let ok = supported(&b.profile);
            if !ok {
                tracing::info!(
                    "Skipping batch {}: {} is not supported by provisioner {}",
                    b.id,
                    b.profile,
                    provisioner
                );
            }
            ok
        })
        .collect()
}
