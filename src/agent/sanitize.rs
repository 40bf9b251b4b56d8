#![forbid(unsafe_code)]

use std::path::{Path, PathBuf};

use crate::error::{AppError, Result};

// The environment handed to agent subprocesses is limited to these dirs;
// bare executable names are resolved against the same list.
pub const RESTRICTED_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

const MAX_TITLE_LEN: usize = 255;

// Task titles end up in a prompt argument and in environment variables.
// Path separators, shell metacharacters, quotes and control characters are
// replaced; the result is length-capped and never empty.
#[must_use]
pub fn sanitize_title(input: &str) -> String {
    let stripped = input.replace("..", "_");

    let mut out = String::with_capacity(stripped.len());
    for c in stripped.chars() {
        let dangerous = matches!(
            c,
            '/' | '\\'
                | '~'
                | '$'
                | '`'
                | '|'
                | '&'
                | ';'
                | '('
                | ')'
                | '['
                | ']'
                | '{'
                | '}'
                | '<'
                | '>'
                | '!'
                | '?'
                | '*'
                | '\''
                | '"'
        ) || c.is_control();
        out.push(if dangerous { '_' } else { c });
    }

    let mut out: String = out.chars().take(MAX_TITLE_LEN).collect();
    if out.trim().is_empty() {
        out = "unnamed".to_owned();
    }
    out
}

#[derive(Debug, Clone)]
pub struct PathPolicy {
    pub allowed_roots: Vec<PathBuf>,
    pub max_depth: usize,
}

impl Default for PathPolicy {
    fn default() -> Self {
        let mut allowed_roots = Vec::new();
        if let Some(home) = std::env::var_os("HOME") {
            allowed_roots.push(PathBuf::from(home));
        }
        Self {
            allowed_roots,
            max_depth: 16,
        }
    }
}

// A project root must canonicalize to an existing directory under one of
// the allowed roots, carry no traversal sequence, and stay within a sane
// nesting depth.
pub fn validate_project_root(policy: &PathPolicy, input: &Path) -> Result<PathBuf> {
    if input.to_string_lossy().contains("..") {
        return Err(AppError::Validation(format!(
            "path traversal not allowed: {}",
            input.display()
        )));
    }

    let resolved = input
        .canonicalize()
        .map_err(|e| AppError::Validation(format!("invalid project root {}: {e}", input.display())))?;
    if !resolved.is_dir() {
        return Err(AppError::Validation(format!(
            "project root is not a directory: {}",
            resolved.display()
        )));
    }

    let depth = resolved.components().count();
    if depth > policy.max_depth {
        return Err(AppError::Validation(format!(
            "path too deep ({depth} levels, max {})",
            policy.max_depth
        )));
    }

    if !policy.allowed_roots.is_empty()
        && !policy
            .allowed_roots
            .iter()
            .any(|root| resolved.starts_with(root))
    {
        return Err(AppError::Validation(format!(
            "project root is outside the allowed directories: {}",
            resolved.display()
        )));
    }

    Ok(resolved)
}

// Bare names are looked up on the restricted PATH only; explicit paths are
// taken as given. Either way the target must be a regular executable file,
// and shell scripts must open with an interpreter directive.
pub fn resolve_agent_executable(command: &str) -> Result<PathBuf> {
    let command = command.trim();
    if command.is_empty() {
        return Err(AppError::Validation("agent executable is empty".to_owned()));
    }

    if command.contains(std::path::MAIN_SEPARATOR) {
        return validate_executable(Path::new(command));
    }

    for dir in RESTRICTED_PATH.split(':') {
        let candidate = Path::new(dir).join(command);
        if candidate.is_file() {
            return validate_executable(&candidate);
        }
    }
    Err(AppError::Validation(format!(
        "agent executable '{command}' not found on {RESTRICTED_PATH}"
    )))
}

pub fn validate_executable(path: &Path) -> Result<PathBuf> {
    let meta = std::fs::metadata(path)
        .map_err(|e| AppError::Validation(format!("agent executable {}: {e}", path.display())))?;
    if !meta.is_file() {
        return Err(AppError::Validation(format!(
            "not a regular file: {}",
            path.display()
        )));
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt as _;
        if meta.permissions().mode() & 0o111 == 0 {
            return Err(AppError::Validation(format!(
                "file is not executable: {}",
                path.display()
            )));
        }
    }

    let name = path.file_name().and_then(|s| s.to_str()).unwrap_or("");
    if (name.ends_with(".sh") || name.ends_with(".bash")) && !has_shebang(path) {
        return Err(AppError::Validation(format!(
            "shell script missing interpreter directive: {}",
            path.display()
        )));
    }

    Ok(path.to_path_buf())
}

fn has_shebang(path: &Path) -> bool {
    std::fs::read(path)
        .map(|data| data.starts_with(b"#!"))
        .unwrap_or(false)
}
