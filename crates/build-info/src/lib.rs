//! Build metadata shared by every buildhost binary.
//!
//! The release (newest `vX.Y.Z` git tag, else the package version) is also
//! the version portion of the node handshake, so two binaries built from
//! different releases never agree on a channel.

use once_cell::sync::Lazy;

#[derive(Debug)]
struct BuildMeta {
    release: String,
    build_id: String,
    build_time: String,
    git_label: String,
    version: VersionTriple,
}

/// `major.minor.patch` of the workspace release, as handshake integers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VersionTriple {
    pub major: i32,
    pub minor: i32,
    pub patch: i32,
}

impl BuildMeta {
    fn collect() -> Self {
        let release = option_env!("BUILDHOST_RELEASE")
            .unwrap_or(env!("CARGO_PKG_VERSION"))
            .to_string();
        let build_id = option_env!("BUILDHOST_BUILD_ID")
            .unwrap_or("unknown build")
            .to_string();
        let build_time = option_env!("BUILDHOST_BUILD_TIME")
            .unwrap_or("unknown time")
            .to_string();
        let git_label = option_env!("BUILDHOST_BUILD_GIT")
            .unwrap_or("unknown git")
            .to_string();
        let version = parse_version(&release);
        Self {
            release,
            build_id,
            build_time,
            git_label,
            version,
        }
    }
}

static META: Lazy<BuildMeta> = Lazy::new(BuildMeta::collect);

/// Release string the handshake version is parsed from (e.g. "1.2.3").
pub fn release() -> &'static str {
    META.release.as_str()
}

/// Full build identifier (e.g. "1.2.3 | 2025-10-05 15:47:12 UTC | v1.2.3-4-g8a4f1d2-dirty").
pub fn build_id() -> &'static str {
    META.build_id.as_str()
}

/// Human readable UTC timestamp captured at build time.
pub fn build_timestamp() -> &'static str {
    META.build_time.as_str()
}

/// Git tag/commit label detected at build time.
pub fn git_label() -> &'static str {
    META.git_label.as_str()
}

/// Release version as handshake components.
pub fn version() -> VersionTriple {
    META.version
}

/// Startup banner for a specific binary.
pub fn formatted_banner(package: &str, version: &str) -> String {
    format!("{} {} | {}", package, version, build_id())
}

/// Lenient `major.minor.patch[-pre]` parser; missing or non-numeric parts are 0.
pub fn parse_version(raw: &str) -> VersionTriple {
    let core = raw.split(['-', '+']).next().unwrap_or_default();
    let mut parts = core
        .split('.')
        .map(|part| part.trim().parse::<i32>().unwrap_or(0));
    VersionTriple {
        major: parts.next().unwrap_or(0),
        minor: parts.next().unwrap_or(0),
        patch: parts.next().unwrap_or(0),
    }
}
