use std::env;
use std::path::{Path, PathBuf};
use std::process::Command;

use chrono::Utc;

const BUILD_ID_OVERRIDE: &str = "BUILDHOST_BUILD_ID_OVERRIDE";
const RELEASE_OVERRIDE: &str = "BUILDHOST_RELEASE_OVERRIDE";

fn main() {
    println!("cargo:rerun-if-env-changed={}", BUILD_ID_OVERRIDE);
    println!("cargo:rerun-if-env-changed={}", RELEASE_OVERRIDE);

    let manifest_dir = PathBuf::from(env::var("CARGO_MANIFEST_DIR").unwrap_or_default());
    if let Some(git_dir) = git(&manifest_dir, &["rev-parse", "--absolute-git-dir"]) {
        let git_dir = PathBuf::from(git_dir);
        for watched in ["HEAD", "refs/tags", "packed-refs"] {
            println!("cargo:rerun-if-changed={}", git_dir.join(watched).display());
        }
    }

    // The release feeds the handshake version, so it comes from the newest
    // `vX.Y.Z` tag when there is one and from the package version otherwise.
    let release = env::var(RELEASE_OVERRIDE)
        .ok()
        .or_else(|| release_tag(&manifest_dir))
        .unwrap_or_else(|| env::var("CARGO_PKG_VERSION").unwrap_or_default());

    let build_time = Utc::now().format("%Y-%m-%d %H:%M:%S UTC").to_string();
    let git_label = git(&manifest_dir, &["describe", "--tags", "--dirty", "--always"])
        .unwrap_or_else(|| "unknown".to_string());
    let build_id = env::var(BUILD_ID_OVERRIDE)
        .unwrap_or_else(|_| format!("{} | {} | {}", release, build_time, git_label));

    println!("cargo:rustc-env=BUILDHOST_RELEASE={}", release);
    println!("cargo:rustc-env=BUILDHOST_BUILD_ID={}", build_id);
    println!("cargo:rustc-env=BUILDHOST_BUILD_TIME={}", build_time);
    println!("cargo:rustc-env=BUILDHOST_BUILD_GIT={}", git_label);
}

/// `1.4.2` for a `v1.4.2` (or `buildhost-v1.4.2`) tag; `None` for anything else.
fn release_tag(repo: &Path) -> Option<String> {
    let tag = git(repo, &["describe", "--tags", "--abbrev=0", "--match", "*v[0-9]*"])?;
    let start = tag
        .match_indices('v')
        .map(|(at, _)| at + 1)
        .find(|&at| tag[at..].starts_with(|c: char| c.is_ascii_digit()))?;
    let version = &tag[start..];
    let core = version.split(['-', '+']).next()?;
    let numeric = !core.is_empty()
        && core
            .split('.')
            .all(|part| !part.is_empty() && part.bytes().all(|b| b.is_ascii_digit()));
    numeric.then(|| version.to_string())
}

fn git(repo: &Path, args: &[&str]) -> Option<String> {
    let output = Command::new("git")
        .arg("-C")
        .arg(repo)
        .args(args)
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let text = String::from_utf8_lossy(&output.stdout).trim().to_string();
    (!text.is_empty()).then_some(text)
}
