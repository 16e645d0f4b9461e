// SPDX-License-Identifier: MIT OR Apache-2.0
//! Executable discovery in `PATH`.

use std::ffi::OsStr;
use std::path::{Path, PathBuf};

/// Locate an executable by name, similarly to shell `which`.
///
/// A name containing a path separator is checked directly. Otherwise each
/// directory of `path` (or the process `PATH` when `None`) is searched in
/// order. Only regular files with an execute bit count as found.
pub fn resolve_program(program: &str, path: Option<&OsStr>) -> Option<PathBuf> {
    let candidate = Path::new(program);
    if candidate.components().count() > 1 {
        return is_executable(candidate).then(|| candidate.to_path_buf());
    }

    let inherited;
    let path = match path {
        Some(p) => p,
        None => {
            inherited = std::env::var_os("PATH")?;
            inherited.as_os_str()
        }
    };
    std::env::split_paths(path).find_map(|dir| resolve_in_dir(&dir, program))
}

/// `true` when `program` resolves through the process `PATH`.
pub fn program_exists(program: &str) -> bool {
    resolve_program(program, None).is_some()
}

fn resolve_in_dir(dir: &Path, program: &str) -> Option<PathBuf> {
    let direct = dir.join(program);
    if is_executable(&direct) {
        return Some(direct);
    }

    if !cfg!(windows) {
        return None;
    }

    [".exe", ".cmd", ".bat", ".com"]
        .into_iter()
        .map(|ext| dir.join(format!("{program}{ext}")))
        .find(|candidate| is_executable(candidate))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}
