use std::fs;
use std::path::Path;
use std::path::PathBuf;

const MAX_DEPTH: usize = 20;

#[cfg(unix)]
fn forbidden_roots() -> Vec<PathBuf> {
    [
        "/etc", "/sys", "/proc", "/dev", "/bin", "/sbin", "/usr/bin", "/usr/sbin", "/boot",
        "/root", "/var/log",
    ]
    .iter()
    .map(PathBuf::from)
    .collect()
}

#[cfg(windows)]
fn forbidden_roots() -> Vec<PathBuf> {
    let mut roots = vec![
        PathBuf::from("C:\\Windows"),
        PathBuf::from("C:\\Program Files"),
        PathBuf::from("C:\\Program Files (x86)"),
        PathBuf::from("C:\\ProgramData"),
    ];
    if let Ok(system_root) = std::env::var("SYSTEMROOT") {
        roots.push(PathBuf::from(system_root));
    }
    if let Ok(all_users) = std::env::var("ALLUSERSPROFILE") {
        roots.push(PathBuf::from(all_users));
    }
    roots
}

/// Validates a repository path for read-only analysis: resolved absolute
/// path, existing readable non-empty directory, outside the forbidden system
/// roots, depth-bounded. Returns the canonical path on success.
pub fn safe_repo_path(path_str: &str) -> Result<PathBuf, String> {
    if path_str.trim().is_empty() {
        return Err("path cannot be empty".to_string());
    }

    // Canonicalization neutralizes `..` segments and symlinks.
    let path = fs::canonicalize(Path::new(path_str)).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            "path does not exist".to_string()
        } else {
            format!("invalid path: {e}")
        }
    })?;

    if !path.is_dir() {
        return Err("path must be a directory".to_string());
    }

    for forbidden in forbidden_roots() {
        if path.starts_with(&forbidden) {
            return Err(format!(
                "access to system directory '{}' is forbidden",
                forbidden.display()
            ));
        }
    }

    let mut entries = match fs::read_dir(&path) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
            return Err("no read permission on this directory".to_string());
        }
        Err(e) => return Err(format!("cannot list directory: {e}")),
    };
    if entries.next().is_none() {
        return Err("directory is empty".to_string());
    }

    if path.components().count() > MAX_DEPTH {
        return Err(format!("path too deep (max {MAX_DEPTH} levels)"));
    }

    Ok(path)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;

    #[test]
    fn accepts_a_real_repo_directory() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join("main.rs"), "fn main() {}").unwrap();
        let resolved = safe_repo_path(tmp.path().to_str().unwrap()).unwrap();
        assert!(resolved.is_absolute());
    }

    #[test]
    fn rejects_missing_empty_and_file_paths() {
        assert!(safe_repo_path("").is_err());
        assert!(safe_repo_path("/definitely/not/here").is_err());

        let tmp = tempfile::tempdir().unwrap();
        // empty directory
        assert_eq!(
            safe_repo_path(tmp.path().to_str().unwrap()).unwrap_err(),
            "directory is empty"
        );
        // plain file
        let file = tmp.path().join("f.txt");
        fs::write(&file, "x").unwrap();
        assert!(safe_repo_path(file.to_str().unwrap()).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn rejects_system_roots_even_via_traversal() {
        // Every entry in the forbidden table is refused, whether it exists
        // on this machine (forbidden) or not (nonexistent).
        for root in [
            "/etc", "/sys", "/proc", "/dev", "/bin", "/sbin", "/usr/bin", "/usr/sbin", "/boot",
            "/root", "/var/log",
        ] {
            assert!(safe_repo_path(root).is_err(), "{root} must be rejected");
        }
        // Traversal and symlink tricks resolve before the check.
        assert!(safe_repo_path("/tmp/../etc").is_err());
        assert!(safe_repo_path("/tmp/../root").is_err());
    }
}
