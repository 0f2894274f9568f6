use std::env;
use std::fs;
use std::path::PathBuf;

/// Mirrors `validate_registry_path` in `main.rs` (not exported from the
/// library, so the check is duplicated here against the same inputs).
fn validate_registry_path(path: &std::path::Path) -> anyhow::Result<PathBuf> {
    use anyhow::bail;

    let path_str = path.to_string_lossy();
    if path_str.contains("..") {
        bail!("registry path cannot contain parent directory references (..)");
    }

    let absolute_path = if path.is_absolute() {
        path.to_path_buf()
    } else {
        env::current_dir()?.join(path)
    };

    let canonical = match absolute_path.canonicalize() {
        Ok(p) => p,
        Err(_) => {
            let parent = absolute_path
                .parent()
                .ok_or_else(|| anyhow::anyhow!("invalid registry path: no parent directory"))?;
            fs::create_dir_all(parent)?;
            absolute_path
        }
    };

    let canonical_str = canonical.to_string_lossy();
    let forbidden_prefixes = ["/etc", "/sys", "/proc", "/boot", "/dev"];
    for prefix in &forbidden_prefixes {
        if canonical_str.starts_with(prefix) {
            bail!("registry path cannot be in system directory: {}", prefix);
        }
    }

    Ok(canonical)
}

#[test]
fn valid_relative_path_is_accepted() {
    let temp_dir = env::temp_dir().join("procmind_test_path_validation");
    fs::create_dir_all(&temp_dir).unwrap();

    let original_dir = env::current_dir().unwrap();
    env::set_current_dir(&temp_dir).unwrap();

    fs::create_dir_all("state").unwrap();
    fs::write("state/registry.json", "{}").unwrap();

    let result = validate_registry_path(std::path::Path::new("state/registry.json"));
    assert!(result.is_ok(), "valid relative path should be accepted");

    env::set_current_dir(&original_dir).unwrap();
    fs::remove_dir_all(&temp_dir).unwrap();
}

#[test]
fn parent_directory_traversal_is_blocked() {
    let result = validate_registry_path(std::path::Path::new("../../etc/passwd"));
    assert!(result.is_err());
    assert!(result.unwrap_err().to_string().contains("parent directory references"));
}

#[test]
fn system_directories_are_blocked() {
    let system_paths = ["/etc/procmind.json", "/sys/kernel/x", "/proc/x", "/boot/x", "/dev/x"];

    for path in system_paths {
        let result = validate_registry_path(std::path::Path::new(path));
        assert!(result.is_err(), "system path {path} should be blocked");
        assert!(result.unwrap_err().to_string().contains("system directory"));
    }
}

#[test]
fn nonexistent_file_with_valid_parent_is_accepted() {
    let temp_dir = env::temp_dir().join("procmind_test_new_file");
    fs::create_dir_all(&temp_dir).unwrap();

    let result = validate_registry_path(&temp_dir.join("new_registry.json"));
    assert!(result.is_ok(), "non-existent file with a valid parent should be accepted");

    fs::remove_dir_all(&temp_dir).unwrap();
}

#[test]
fn absolute_path_is_accepted() {
    let temp_dir = env::temp_dir().join("procmind_test_absolute_path");
    fs::create_dir_all(&temp_dir).unwrap();
    let test_file = temp_dir.join("registry.json");
    fs::write(&test_file, "{}").unwrap();

    let result = validate_registry_path(&test_file);
    assert!(result.is_ok(), "absolute path should be accepted");

    fs::remove_dir_all(&temp_dir).unwrap();
}

#[test]
fn obfuscated_traversal_attempts_are_blocked() {
    let malicious_paths = ["./../../../etc/passwd", "subdir/../../etc/passwd"];

    for path in malicious_paths {
        let result = validate_registry_path(std::path::Path::new(path));
        assert!(result.is_err(), "malicious path {path} should be blocked");
        assert!(result.unwrap_err().to_string().contains("parent directory references"));
    }
}
