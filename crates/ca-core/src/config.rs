use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Application configuration loaded from ~/.config/consent-audit/config.toml.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct AppConfig {
    pub timeouts: Timeouts,
    pub run: RunSettings,
    pub collector: CollectorSettings,
    pub browser: BrowserSettings,
}

/// Crawl and collector budgets, all in milliseconds.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct Timeouts {
    pub navigation_ms: u64,
    pub post_consent_wait_ms: u64,
    pub scrape_ms: u64,
    pub action_ms: u64,
    pub detect_ms: u64,
    pub found_ms: u64,
    pub total_budget_ms: u64,
    pub collector_extra_ms: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            navigation_ms: 45_000,
            post_consent_wait_ms: 10_000,
            scrape_ms: 20_000,
            action_ms: 30_000,
            detect_ms: 8_000,
            found_ms: 8_000,
            total_budget_ms: 35_000,
            collector_extra_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

impl Default for Viewport {
    fn default() -> Self {
        Self {
            width: 1366,
            height: 768,
        }
    }
}

/// Values recorded in the report's run metadata.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct RunSettings {
    pub locale: String,
    pub jurisdiction: String,
    pub user_agent: Option<String>,
    pub viewport: Viewport,
    pub gpc_enabled: bool,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            locale: "EU".to_string(),
            jurisdiction: "GDPR".to_string(),
            user_agent: None,
            viewport: Viewport::default(),
            gpc_enabled: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct CollectorSettings {
    /// Consent script bundle. Defaults to the copy under `shared/autoconsent/`.
    pub script_path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct BrowserSettings {
    pub executable: Option<PathBuf>,
    pub headless: bool,
}

impl Default for BrowserSettings {
    fn default() -> Self {
        Self {
            executable: None,
            headless: true,
        }
    }
}

/// Get the config file path.
pub fn config_path() -> PathBuf {
    if let Ok(home) = std::env::var("HOME") {
        PathBuf::from(home)
            .join(".config")
            .join("consent-audit")
            .join("config.toml")
    } else if let Ok(appdata) = std::env::var("APPDATA") {
        PathBuf::from(appdata)
            .join("consent-audit")
            .join("config.toml")
    } else {
        PathBuf::from("config.toml")
    }
}

/// Load the application config from the default path, then apply
/// environment overrides.
pub fn load_config() -> AppConfig {
    let mut config = load_config_from(&config_path());
    config.apply_env_overrides();
    config
}

/// Load a config file. Missing or unreadable files yield defaults.
pub fn load_config_from(path: &Path) -> AppConfig {
    if !path.exists() {
        return AppConfig::default();
    }

    match std::fs::read_to_string(path) {
        Ok(content) => toml::from_str(&content).unwrap_or_else(|e| {
            log::warn!("Failed to parse config at {}: {e}", path.display());
            AppConfig::default()
        }),
        Err(e) => {
            log::warn!("Failed to read config at {}: {e}", path.display());
            AppConfig::default()
        }
    }
}

impl AppConfig {
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply overrides from any key lookup. Unparseable numbers are ignored.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let t = &mut self.timeouts;
        let numeric: [(&str, &mut u64); 8] = [
            ("NAV_TIMEOUT_MS", &mut t.navigation_ms),
            ("POST_CONSENT_WAIT_MS", &mut t.post_consent_wait_ms),
            ("AUTOCONSENT_SCRAPE_TIMEOUT_MS", &mut t.scrape_ms),
            ("AUTOCONSENT_ACTION_TIMEOUT_MS", &mut t.action_ms),
            ("AUTOCONSENT_DETECT_TIMEOUT_MS", &mut t.detect_ms),
            ("AUTOCONSENT_FOUND_TIMEOUT_MS", &mut t.found_ms),
            ("AUTOCONSENT_TOTAL_BUDGET_MS", &mut t.total_budget_ms),
            ("COLLECTOR_EXTRA_TIME_MS", &mut t.collector_extra_ms),
        ];
        for (key, slot) in numeric {
            if let Some(raw) = lookup(key) {
                match raw.trim().parse::<u64>() {
                    Ok(v) => *slot = v,
                    Err(e) => log::warn!("Ignoring {key}={raw:?}: {e}"),
                }
            }
        }

        if let Some(locale) = lookup("CONSENT_AUDIT_LOCALE").filter(|v| !v.is_empty()) {
            self.run.locale = locale;
        }
        if let Some(ua) = lookup("CONSENT_AUDIT_USER_AGENT").filter(|v| !v.is_empty()) {
            self.run.user_agent = Some(ua);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::io::Write;

    use super::*;

    #[test]
    fn config_path_ends_with_expected_components() {
        let path = config_path();
        let path_str = path.to_string_lossy();
        assert!(path.ends_with("config.toml"));
        if std::env::var("HOME").is_ok() {
            assert!(path_str.contains("consent-audit"), "{path_str}");
        }
    }

    #[test]
    fn defaults_match_documented_budgets() {
        let t = Timeouts::default();
        assert_eq!(t.navigation_ms, 45_000);
        assert_eq!(t.post_consent_wait_ms, 10_000);
        assert_eq!(t.scrape_ms, 20_000);
        assert_eq!(t.action_ms, 30_000);
        assert_eq!(t.detect_ms, 8_000);
        assert_eq!(t.found_ms, 8_000);
        assert_eq!(t.total_budget_ms, 35_000);
        assert_eq!(t.collector_extra_ms, 5_000);

        let run = RunSettings::default();
        assert_eq!(run.locale, "EU");
        assert_eq!(run.viewport, Viewport { width: 1366, height: 768 });
        assert!(BrowserSettings::default().headless);
    }

    #[test]
    fn partial_toml_keeps_other_defaults() {
        let config: AppConfig = toml::from_str(
            r#"
[timeouts]
detect_ms = 2000

[run]
locale = "US"
gpc_enabled = true

[collector]
script_path = "/opt/autoconsent.js"
"#,
        )
        .expect("parse toml");
        assert_eq!(config.timeouts.detect_ms, 2_000);
        assert_eq!(config.timeouts.found_ms, 8_000);
        assert_eq!(config.run.locale, "US");
        assert_eq!(config.run.jurisdiction, "GDPR");
        assert!(config.run.gpc_enabled);
        assert_eq!(
            config.collector.script_path.as_deref(),
            Some(Path::new("/opt/autoconsent.js"))
        );
    }

    #[test]
    fn empty_toml_is_default() {
        let config: AppConfig = toml::from_str("").expect("empty toml should parse");
        assert_eq!(config, AppConfig::default());
    }

    #[test]
    fn load_from_file() {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        writeln!(file, "[timeouts]\nnavigation_ms = 1000").expect("write");
        let config = load_config_from(file.path());
        assert_eq!(config.timeouts.navigation_ms, 1_000);
    }

    #[test]
    fn bad_file_falls_back_to_defaults() {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        writeln!(file, "this is = = not toml").expect("write");
        assert_eq!(load_config_from(file.path()), AppConfig::default());
    }

    #[test]
    fn missing_file_is_default() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = load_config_from(&dir.path().join("absent.toml"));
        assert_eq!(config, AppConfig::default());
    }

    #[test]
    fn overrides_apply_and_skip_garbage() {
        let env = HashMap::from([
            ("NAV_TIMEOUT_MS", "1234"),
            ("AUTOCONSENT_TOTAL_BUDGET_MS", " 500 "),
            ("COLLECTOR_EXTRA_TIME_MS", "soon"),
            ("CONSENT_AUDIT_LOCALE", "UK"),
            ("CONSENT_AUDIT_USER_AGENT", "AuditBot/1.0"),
        ]);
        let mut config = AppConfig::default();
        config.apply_overrides(|k| env.get(k).map(|v| v.to_string()));

        assert_eq!(config.timeouts.navigation_ms, 1_234);
        assert_eq!(config.timeouts.total_budget_ms, 500);
        assert_eq!(config.timeouts.collector_extra_ms, 5_000);
        assert_eq!(config.run.locale, "UK");
        assert_eq!(config.run.user_agent.as_deref(), Some("AuditBot/1.0"));
    }
}
