//! Startup checks for configured paths. Problems are reported as warnings, never fatal.

use std::env;
use std::path::{Path, PathBuf};

use crate::config::Config;

/// Check if metadata indicates a valid executable file (pure function).
/// Returns an error message if validation fails, None if valid.
#[allow(unused_variables)]
fn check_executable_metadata(is_file: bool, mode: u32) -> Option<String> {
    if !is_file {
        return Some("Path is not a file".to_string());
    }

    #[cfg(unix)]
    {
        if mode & 0o111 == 0 {
            return Some("File is not executable".to_string());
        }
    }

    None
}

fn file_error_message(error: &std::io::Error) -> String {
    match error.kind() {
        std::io::ErrorKind::NotFound => "File not found".to_string(),
        std::io::ErrorKind::PermissionDenied => "Cannot access file".to_string(),
        _ => "Invalid path".to_string(),
    }
}

fn check_executable(path: &Path) -> Option<String> {
    match std::fs::metadata(path) {
        Ok(metadata) => {
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                check_executable_metadata(metadata.is_file(), metadata.permissions().mode())
            }
            #[cfg(not(unix))]
            {
                check_executable_metadata(metadata.is_file(), 0)
            }
        }
        Err(e) => Some(file_error_message(&e)),
    }
}

/// First executable named `name` in the `PATH` directories.
fn find_on_path(name: &str, path_var: Option<&std::ffi::OsStr>) -> Option<PathBuf> {
    env::split_paths(path_var?)
        .map(|dir| dir.join(name))
        .find(|candidate| check_executable(candidate).is_none())
}

/// Validate the backend command. A bare name (no separator) is looked up on `PATH`.
pub fn validate_backend_command(command: &str) -> Option<String> {
    if command.is_empty() {
        return Some("Command cannot be empty".to_string());
    }

    if !command.contains('/') && !command.contains('\\') {
        return match find_on_path(command, env::var_os("PATH").as_deref()) {
            Some(_) => None,
            None => Some(format!("`{}` not found on PATH", command)),
        };
    }

    check_executable(&Config::expand_tilde(command))
}

fn check_directory_metadata(is_dir: bool) -> Option<String> {
    if !is_dir {
        Some("Path is not a directory".to_string())
    } else {
        None
    }
}

fn directory_error_message(error: &std::io::Error) -> String {
    match error.kind() {
        std::io::ErrorKind::NotFound => "Directory not found".to_string(),
        std::io::ErrorKind::PermissionDenied => "Cannot access directory".to_string(),
        _ => "Invalid path".to_string(),
    }
}

/// Validate that a path points to an existing directory.
/// Returns an error message if validation fails, None if valid.
pub fn validate_directory_exists(path: &Path) -> Option<String> {
    if path.as_os_str().is_empty() {
        return Some("Path cannot be empty".to_string());
    }

    match std::fs::metadata(path) {
        Ok(metadata) => check_directory_metadata(metadata.is_dir()),
        Err(e) => Some(directory_error_message(&e)),
    }
}

/// Human-readable warnings for the loaded configuration.
///
/// A missing templates directory is fine (built-ins still load) unless it was configured explicitly.
pub fn config_warnings(config: &Config) -> Vec<String> {
    let mut warnings = Vec::new();

    if let Some(message) = validate_backend_command(&config.backend.command) {
        warnings.push(format!("backend.command `{}`: {}", config.backend.command, message));
    }

    if config.paths.templates.is_some()
        && let Some(dir) = config.templates_dir()
        && let Some(message) = validate_directory_exists(&dir)
    {
        warnings.push(format!("paths.templates `{}`: {}", dir.display(), message));
    }

    if config.paths.spec_suffix.trim().is_empty() {
        warnings.push("paths.spec_suffix is empty; every file would be a spec".to_string());
    }

    warnings
}
