// Utility Functions
// Config file discovery and project root detection

use crate::parser::error::ConfigError;
use crate::parser::loader::DEFAULT_CONFIG_FILE;

use std::path::{Path, PathBuf};

/// File names searched for, in order of preference
pub const CONFIG_FILE_NAMES: &[&str] = &[DEFAULT_CONFIG_FILE, "gantry.yaml", ".gantry.yml"];

/// Find the root of a git repository by walking up from the given starting path.
///
/// Returns `None` if no `.git` entry is found in any ancestor.
pub fn find_repo_root(start: &Path) -> Option<PathBuf> {
    let start = start.canonicalize().ok()?;
    for ancestor in start.ancestors() {
        if ancestor.join(".git").exists() {
            return Some(ancestor.to_path_buf());
        }
    }
    None
}

/// Find a config file in `start` or one of its ancestors.
///
/// The search stops at the repository root when `start` is inside one.
pub fn find_config_file(start: &Path) -> Option<PathBuf> {
    let start = start.canonicalize().ok()?;
    let boundary = find_repo_root(&start);

    for ancestor in start.ancestors() {
        for name in CONFIG_FILE_NAMES {
            let candidate = ancestor.join(name);
            if candidate.is_file() {
                return Some(candidate);
            }
        }
        if boundary.as_deref() == Some(ancestor) {
            break;
        }
    }
    None
}

/// Resolve the config path: an explicit path as given, otherwise discovery
/// from the current directory.
pub fn resolve_config_path(explicit: Option<&Path>) -> Result<PathBuf, ConfigError> {
    if let Some(path) = explicit {
        return Ok(path.to_path_buf());
    }

    let cwd = std::env::current_dir().map_err(|e| ConfigError::io(Path::new("."), &e))?;
    find_config_file(&cwd).ok_or_else(|| {
        ConfigError::invalid_value(format!(
            "no {} found in {} or its parent directories",
            DEFAULT_CONFIG_FILE,
            cwd.display()
        ))
        .with_suggestion("pass the config file explicitly with --file")
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::fs;

    #[test]
    fn test_find_repo_root_with_git_dir() {
        let temp = tempfile::tempdir().unwrap();
        let root = temp.path();
        fs::create_dir(root.join(".git")).unwrap();

        let sub = root.join("a").join("b").join("c");
        fs::create_dir_all(&sub).unwrap();

        let found = find_repo_root(&sub).unwrap();
        assert_eq!(found, root.canonicalize().unwrap());
    }

    #[test]
    fn test_find_repo_root_nonexistent_path() {
        assert!(find_repo_root(Path::new("/nonexistent/path/that/does/not/exist")).is_none());
    }

    #[test]
    fn test_find_config_in_ancestor() {
        let temp = tempfile::tempdir().unwrap();
        let root = temp.path();
        fs::create_dir(root.join(".git")).unwrap();
        fs::write(root.join("gantry.yaml"), "jobs: {}").unwrap();

        let sub = root.join("src").join("module");
        fs::create_dir_all(&sub).unwrap();

        let found = find_config_file(&sub).unwrap();
        assert_eq!(found, root.canonicalize().unwrap().join("gantry.yaml"));
    }

    #[test]
    fn test_find_config_prefers_default_name() {
        let temp = tempfile::tempdir().unwrap();
        fs::write(temp.path().join("gantry.yaml"), "").unwrap();
        fs::write(temp.path().join("gantry.yml"), "").unwrap();

        let found = find_config_file(temp.path()).unwrap();
        assert!(found.ends_with("gantry.yml"));
    }

    #[test]
    fn test_find_config_stops_at_repo_root() {
        let temp = tempfile::tempdir().unwrap();
        fs::write(temp.path().join("gantry.yml"), "").unwrap();

        let repo = temp.path().join("repo");
        fs::create_dir_all(repo.join(".git")).unwrap();

        assert!(find_config_file(&repo).is_none());
    }

    #[test]
    fn test_explicit_config_path_is_kept() {
        let path = resolve_config_path(Some(Path::new("ci/gantry.yml"))).unwrap();
        assert_eq!(path, PathBuf::from("ci/gantry.yml"));
    }
}
