//! Encoder executable checks performed before a job launches anything.

use std::env;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

/// Error type for the encoder sanity check
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SanityError {
    /// No executable configured
    #[error("Executable path is empty")]
    EmptyPath,

    /// No runnable file was found directly or on PATH
    #[error("Executable '{0}' was not found")]
    NotFound(String),

    /// The path exists but is not a regular file
    #[error("'{0}' is not a file")]
    NotAFile(String),
}

/// Resolve `program` against the process `PATH`.
pub fn resolve_executable(program: &str) -> Result<PathBuf, SanityError> {
    resolve_executable_in(program, env::var_os("PATH"))
}

/// Resolve `program` against an explicit search path.
///
/// A program containing a path separator is checked as given; a bare name is
/// searched for in each directory of `search_path`. Either way the result
/// must be executable by this process.
pub fn resolve_executable_in(
    program: &str,
    search_path: Option<OsString>,
) -> Result<PathBuf, SanityError> {
    let program = program.trim();
    if program.is_empty() {
        return Err(SanityError::EmptyPath);
    }

    let candidate = Path::new(program);
    let has_separator = candidate.components().count() > 1 || candidate.is_absolute();
    if has_separator && candidate.is_dir() {
        return Err(SanityError::NotAFile(program.to_string()));
    }
    if !has_separator && search_path.is_none() {
        return Err(SanityError::NotFound(program.to_string()));
    }

    let cwd = env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    which::which_in(program, search_path, cwd).map_err(|e| {
        debug!(program, error = %e, "Executable lookup failed");
        SanityError::NotFound(program.to_string())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[cfg(unix)]
    fn write_file(path: &Path, mode: u32) {
        use std::os::unix::fs::PermissionsExt;
        std::fs::write(path, b"#!/bin/sh\n").unwrap();
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).unwrap();
    }

    #[test]
    fn test_empty_path_rejected() {
        assert_eq!(resolve_executable("  "), Err(SanityError::EmptyPath));
    }

    #[cfg(unix)]
    #[test]
    fn test_direct_path() {
        let dir = TempDir::new().unwrap();
        let exe = dir.path().join("encoder");
        write_file(&exe, 0o755);

        let resolved = resolve_executable(exe.to_str().unwrap()).unwrap();
        assert_eq!(resolved, exe);

        let missing = dir.path().join("missing");
        assert!(matches!(
            resolve_executable(missing.to_str().unwrap()),
            Err(SanityError::NotFound(_))
        ));
        assert!(matches!(
            resolve_executable(dir.path().to_str().unwrap()),
            Err(SanityError::NotAFile(_))
        ));
    }

    #[cfg(unix)]
    #[test]
    fn test_search_path_lookup() {
        let first = TempDir::new().unwrap();
        let second = TempDir::new().unwrap();
        let exe = second.path().join("fakeenc");
        write_file(&exe, 0o755);

        let search = env::join_paths([first.path(), second.path()]).unwrap();
        let resolved = resolve_executable_in("fakeenc", Some(search.clone())).unwrap();
        assert_eq!(resolved, exe);

        assert_eq!(
            resolve_executable_in("other", Some(search)),
            Err(SanityError::NotFound("other".to_string()))
        );
        assert!(resolve_executable_in("fakeenc", None).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn test_non_executable_file_rejected() {
        let dir = TempDir::new().unwrap();
        let data = dir.path().join("notexec");
        write_file(&data, 0o644);

        let search = env::join_paths([dir.path()]).unwrap();
        assert_eq!(
            resolve_executable_in("notexec", Some(search)),
            Err(SanityError::NotFound("notexec".to_string()))
        );
        assert!(matches!(
            resolve_executable(data.to_str().unwrap()),
            Err(SanityError::NotFound(_))
        ));
    }

    #[cfg(unix)]
    #[test]
    fn test_system_shell_resolves() {
        assert!(resolve_executable("sh").is_ok());
    }
}
