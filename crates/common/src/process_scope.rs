//! Scoped application of process-wide build context.
//!
//! Working directory and environment are process globals. The server applies a
//! build request's values for the duration of one build, then restores the
//! environment and parks the process in its rest directory on every exit
//! path, including a panicking build engine. Only the holder of the busy lock
//! may create a scope.

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

#[derive(Debug)]
pub struct ProcessContextScope {
    rest_dir: PathBuf,
    saved_env: Vec<(OsString, OsString)>,
}

/// Move the process into `rest_dir`, or the temp dir if that fails.
///
/// A server never idles inside a user directory: an open handle to it would
/// block deleting it.
pub fn park_in(rest_dir: &Path) {
    if std::env::set_current_dir(rest_dir).is_ok() {
        return;
    }
    let fallback = std::env::temp_dir();
    debug!(
        rest_dir = %rest_dir.display(),
        cwd = %fallback.display(),
        "rest directory unavailable; parking in temp dir"
    );
    if let Err(err) = std::env::set_current_dir(&fallback) {
        warn!(cwd = %fallback.display(), "failed to leave build directory: {}", err);
    }
}

impl ProcessContextScope {
    /// Switch cwd and replace the whole environment with `env`. On drop the
    /// environment comes back and the cwd becomes `rest_dir`.
    ///
    /// An empty `env` leaves the environment untouched. A cwd that cannot be
    /// entered is logged and skipped; the build engine will report it.
    pub fn enter(working_dir: &Path, env: &BTreeMap<String, String>, rest_dir: &Path) -> Self {
        let saved_env: Vec<(OsString, OsString)> = std::env::vars_os().collect();

        if !env.is_empty() {
            replace_environment(env.iter().map(|(k, v)| (OsString::from(k), OsString::from(v))));
        }
        if !working_dir.as_os_str().is_empty() {
            if let Err(err) = std::env::set_current_dir(working_dir) {
                warn!(cwd = %working_dir.display(), "failed to enter build directory: {}", err);
            }
        }

        Self {
            rest_dir: rest_dir.to_path_buf(),
            saved_env,
        }
    }
}

impl Drop for ProcessContextScope {
    fn drop(&mut self) {
        replace_environment(self.saved_env.drain(..));
        park_in(&self.rest_dir);
    }
}

fn replace_environment(vars: impl IntoIterator<Item = (OsString, OsString)>) {
    let current: Vec<OsString> = std::env::vars_os().map(|(k, _)| k).collect();
    for key in current {
        std::env::remove_var(key);
    }
    for (key, value) in vars {
        if key.is_empty() {
            continue;
        }
        std::env::set_var(key, value);
    }
}
