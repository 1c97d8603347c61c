use std::path::PathBuf;

use anyhow::{Context, Result};

use ca_core::config::CollectorSettings;
use ca_core::paths;

/// Resolve the consent script bundle: configured path first, then the
/// copies under `shared/autoconsent/`.
pub fn bundle_path(settings: &CollectorSettings) -> Option<PathBuf> {
    settings
        .script_path
        .clone()
        .or_else(paths::default_consent_script)
}

pub fn load_bundle(settings: &CollectorSettings) -> Result<String> {
    let path = bundle_path(settings).context(
        "consent script bundle not found; set collector.script_path or place \
         autoconsent.playwright.js under shared/autoconsent/",
    )?;
    std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read consent script {}", path.display()))
}

/// Bundle source with a prelude that routes `autoconsentSendMessage` into
/// the session binding.
pub fn injected_source(binding_name: &str, bundle: &str) -> String {
    let binding = serde_json::to_string(binding_name).unwrap_or_else(|_| "\"\"".to_string());
    format!(
        "(function(){{\n  \
           window.autoconsentSendMessage = function(msg) {{\n    \
             try {{ window[{binding}](JSON.stringify(msg)); }} catch (e) {{}}\n  \
           }};\n\
         }})();\n{bundle}"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn configured_path_wins() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "console.log('bundle')").unwrap();
        let settings = CollectorSettings {
            script_path: Some(file.path().to_path_buf()),
        };
        assert_eq!(load_bundle(&settings).unwrap(), "console.log('bundle')");
    }

    #[test]
    fn unreadable_bundle_is_an_error() {
        let settings = CollectorSettings {
            script_path: Some(PathBuf::from("/nonexistent/autoconsent.js")),
        };
        let err = load_bundle(&settings).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/autoconsent.js"));
    }

    #[test]
    fn prelude_calls_the_binding_then_runs_the_bundle() {
        let source = injected_source("cdpBinding_abc", "BUNDLE();");
        assert!(source.contains("window.autoconsentSendMessage = function(msg)"));
        assert!(source.contains("window[\"cdpBinding_abc\"](JSON.stringify(msg))"));
        assert!(source.ends_with("\nBUNDLE();"));
    }
}
