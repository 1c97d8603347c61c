use std::path::PathBuf;

/// Resolve the `shared/` directory relative to the executable or workspace root.
pub fn shared_dir() -> PathBuf {
    // 1. Installed layout: <prefix>/bin/consent-audit next to <prefix>/shared
    if let Ok(exe) = std::env::current_exe() {
        if let Some(parent) = exe.parent() {
            for rel in ["../shared", "../../shared"] {
                let candidate = parent.join(rel);
                if candidate.is_dir() {
                    return candidate.canonicalize().unwrap_or(candidate);
                }
            }
        }
    }

    // 2. Dev mode, run from crates/<crate>/
    if let Ok(manifest_dir) = std::env::var("CARGO_MANIFEST_DIR") {
        let candidate = PathBuf::from(manifest_dir).join("../../shared");
        if candidate.is_dir() {
            return candidate.canonicalize().unwrap_or(candidate);
        }
    }

    // 3. Current working directory
    let candidate = PathBuf::from("shared");
    if candidate.is_dir() {
        return candidate.canonicalize().unwrap_or(candidate);
    }

    PathBuf::from("shared")
}

/// Load a YAML file from the shared directory.
pub fn load_shared_yaml(relative_path: &str) -> Option<String> {
    let path = shared_dir().join(relative_path);
    std::fs::read_to_string(&path).ok()
}

/// Locate the consent-detection script bundle under `shared/autoconsent/`.
pub fn default_consent_script() -> Option<PathBuf> {
    let dir = shared_dir().join("autoconsent");
    ["autoconsent.playwright.js", "autoconsent.js"]
        .iter()
        .map(|name| dir.join(name))
        .find(|p| p.is_file())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shared_dir_non_empty() {
        let dir = shared_dir();
        assert!(!dir.as_os_str().is_empty());
    }

    #[test]
    fn test_load_shared_yaml_missing() {
        let result = load_shared_yaml("nonexistent/path/file_xyz_12345.yaml");
        assert!(result.is_none(), "Expected None for non-existent YAML file");
    }

    #[test]
    fn test_load_providers_yaml() {
        if shared_dir().join("providers.yaml").exists() {
            let content = load_shared_yaml("providers.yaml").expect("load providers.yaml");
            assert!(content.contains("GOOGLETAGMAN"));
        }
    }

    #[test]
    fn test_default_consent_script_is_a_file_when_found() {
        if let Some(path) = default_consent_script() {
            assert!(path.is_file());
            assert!(path.to_string_lossy().ends_with(".js"));
        }
    }
}
