//! Data-driven tracker provider registry.
//!
//! Providers are declared in `shared/providers.yaml`. The crate carries its own
//! copy in `data/` which is compiled in, so detection keeps working when the
//! shared directory is absent.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use regex::Regex;
use serde::Deserialize;
use url::Url;

use crate::models::{DetectionField, ProviderGroup, TrackerDetection};
use crate::paths;

const EMBEDDED_PROVIDERS: &str = include_str!("../data/providers.yaml");
const DEFAULT_GROUP: &str = "other";

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("invalid provider file: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("provider {key}: invalid pattern: {source}")]
    Pattern {
        key: String,
        #[source]
        source: regex::Error,
    },
    #[error("duplicate provider key {0}")]
    DuplicateKey(String),
}

/// Anything that can turn a request URL into tracker detections.
pub trait ProviderCatalog: Send + Sync {
    fn detect_all(&self, url: &str, post_data: Option<&str>) -> Vec<TrackerDetection>;
}

/// Display name for a provider type code.
pub fn display_type(code: &str) -> &'static str {
    match code {
        "analytics" => "Analytics",
        "customer" => "Customer Engagement",
        "testing" => "UX Testing",
        "tagmanager" => "Tag Manager",
        "visitorid" => "Visitor Identification",
        "marketing" => "Marketing",
        "replay" => "Session Replay/Heat Maps",
        _ => "Unknown",
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ParamSpec {
    pub name: Option<String>,
    pub group: Option<String>,
    #[serde(default)]
    pub hidden: bool,
}

/// A field pulled out of the URL path by regex captures.
///
/// `value` is a template where `$N` is replaced by capture `N`, or by
/// `defaults[N]` when that capture did not participate.
#[derive(Debug, Clone, Deserialize)]
pub struct PathFieldSpec {
    pub pattern: String,
    pub key: String,
    pub field: Option<String>,
    pub value: String,
    pub group: Option<String>,
    pub hidden: Option<bool>,
    #[serde(default)]
    pub defaults: BTreeMap<usize, String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StaticFieldSpec {
    pub key: String,
    pub field: Option<String>,
    pub value: String,
    pub group: Option<String>,
    pub hidden: Option<bool>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProviderSpec {
    pub key: String,
    pub name: String,
    #[serde(rename = "type")]
    pub type_code: String,
    pub pattern: String,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub columns: BTreeMap<String, String>,
    #[serde(default)]
    pub groups: Vec<ProviderGroup>,
    #[serde(default)]
    pub keys: BTreeMap<String, ParamSpec>,
    #[serde(default)]
    pub path_fields: Vec<PathFieldSpec>,
    #[serde(default)]
    pub static_fields: Vec<StaticFieldSpec>,
}

#[derive(Deserialize)]
struct ProvidersFile {
    providers: Vec<ProviderSpec>,
}

/// A provider with its patterns compiled.
#[derive(Debug, Clone)]
pub struct Provider {
    spec: ProviderSpec,
    pattern: Regex,
    path_patterns: Vec<Regex>,
}

impl Provider {
    fn compile(spec: ProviderSpec) -> Result<Self, CatalogError> {
        let compile = |p: &str| {
            Regex::new(p).map_err(|source| CatalogError::Pattern {
                key: spec.key.clone(),
                source,
            })
        };
        let pattern = compile(&spec.pattern)?;
        let path_patterns = spec
            .path_fields
            .iter()
            .map(|f| compile(&f.pattern))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            spec,
            pattern,
            path_patterns,
        })
    }

    pub fn key(&self) -> &str {
        &self.spec.key
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn display_type(&self) -> &'static str {
        display_type(&self.spec.type_code)
    }

    pub fn pattern(&self) -> &str {
        self.spec.pattern.as_str()
    }

    pub fn keywords(&self) -> &[String] {
        &self.spec.keywords
    }

    pub fn matches(&self, url: &str) -> bool {
        self.pattern.is_match(url)
    }

    /// Parse a matching URL. `None` when the URL is not absolute.
    pub fn parse(&self, raw: &str, post_data: Option<&str>) -> Option<TrackerDetection> {
        let url = Url::parse(raw).ok()?;

        let mut params: Vec<(String, String)> = url
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        if let Some(body) = post_data {
            params.extend(flatten_post_data(body));
        }

        let mut fields: Vec<DetectionField> = params
            .into_iter()
            .filter_map(|(k, v)| self.query_field(k, v))
            .collect();
        fields.extend(self.path_fields(url.path()));
        fields.extend(self.spec.static_fields.iter().map(|f| DetectionField {
            key: f.key.clone(),
            display_field: f.field.clone(),
            group: f.group.clone(),
            hidden: f.hidden,
            value: serde_json::Value::String(f.value.clone()),
        }));

        Some(TrackerDetection {
            provider_key: self.spec.key.clone(),
            provider_name: self.spec.name.clone(),
            provider_type: self.display_type().to_string(),
            url: raw.to_string(),
            columns: self.spec.columns.clone(),
            groups: self.spec.groups.clone(),
            fields,
        })
    }

    fn query_field(&self, key: String, value: String) -> Option<DetectionField> {
        let param = self.spec.keys.get(&key).cloned().unwrap_or_default();
        if param.hidden {
            return None;
        }
        Some(DetectionField {
            display_field: Some(param.name.unwrap_or_else(|| key.clone())),
            group: Some(param.group.unwrap_or_else(|| DEFAULT_GROUP.to_string())),
            hidden: None,
            value: serde_json::Value::String(value),
            key,
        })
    }

    fn path_fields<'a>(&'a self, path: &'a str) -> impl Iterator<Item = DetectionField> + 'a {
        self.spec
            .path_fields
            .iter()
            .zip(&self.path_patterns)
            .filter_map(move |(spec, re)| {
                let caps = re.captures(path)?;
                let groups: Vec<String> = (0..caps.len())
                    .map(|i| match caps.get(i) {
                        Some(m) => m.as_str().to_string(),
                        None => spec.defaults.get(&i).cloned().unwrap_or_default(),
                    })
                    .collect();
                Some(DetectionField {
                    key: spec.key.clone(),
                    display_field: spec.field.clone(),
                    group: spec.group.clone(),
                    hidden: spec.hidden,
                    value: serde_json::Value::String(expand_template(&spec.value, &groups)),
                })
            })
    }
}

fn expand_template(template: &str, groups: &[String]) -> String {
    let mut out = String::with_capacity(template.len());
    let mut chars = template.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '$' {
            out.push(c);
            continue;
        }
        let mut digits = String::new();
        while let Some(d) = chars.peek().filter(|d| d.is_ascii_digit()) {
            digits.push(*d);
            chars.next();
        }
        match digits.parse::<usize>() {
            Ok(i) => out.push_str(groups.get(i).map(String::as_str).unwrap_or_default()),
            Err(_) => out.push('$'),
        }
    }
    out
}

/// Flatten a request body into key/value pairs.
///
/// JSON bodies are walked recursively (`a.b`, `list[0]`); empty containers
/// yield an empty value. Anything else is read as form-encoded.
pub fn flatten_post_data(body: &str) -> Vec<(String, String)> {
    let mut out = Vec::new();
    if body.is_empty() {
        return out;
    }
    match serde_json::from_str::<serde_json::Value>(body) {
        Ok(value) => flatten_json(&value, String::new(), &mut out),
        Err(_) => out.extend(
            url::form_urlencoded::parse(body.as_bytes())
                .map(|(k, v)| (k.into_owned(), v.into_owned())),
        ),
    }
    out
}

fn flatten_json(value: &serde_json::Value, prop: String, out: &mut Vec<(String, String)>) {
    use serde_json::Value;
    match value {
        Value::Array(items) => {
            if items.is_empty() {
                out.push((prop, String::new()));
                return;
            }
            for (i, item) in items.iter().enumerate() {
                flatten_json(item, format!("{prop}[{i}]"), out);
            }
        }
        Value::Object(map) => {
            if map.is_empty() {
                if !prop.is_empty() {
                    out.push((prop, String::new()));
                }
                return;
            }
            for (k, v) in map {
                let next = if prop.is_empty() {
                    k.clone()
                } else {
                    format!("{prop}.{k}")
                };
                flatten_json(v, next, out);
            }
        }
        Value::String(s) => out.push((prop, s.clone())),
        other => out.push((prop, other.to_string())),
    }
}

/// Ordered registry of providers.
#[derive(Debug, Clone, Default)]
pub struct ProviderRegistry {
    providers: Vec<Provider>,
}

impl ProviderRegistry {
    pub fn from_yaml(yaml: &str) -> Result<Self, CatalogError> {
        let file: ProvidersFile = serde_yaml::from_str(yaml)?;
        Self::from_specs(file.providers)
    }

    pub fn from_specs(specs: Vec<ProviderSpec>) -> Result<Self, CatalogError> {
        let mut providers: Vec<Provider> = Vec::with_capacity(specs.len());
        for spec in specs {
            if providers.iter().any(|p| p.key() == spec.key) {
                return Err(CatalogError::DuplicateKey(spec.key));
            }
            providers.push(Provider::compile(spec)?);
        }
        Ok(Self { providers })
    }

    /// The registry compiled into the binary.
    pub fn embedded() -> Result<Self> {
        Self::from_yaml(EMBEDDED_PROVIDERS).context("Failed to parse embedded providers.yaml")
    }

    /// Load `shared/providers.yaml`, falling back to the embedded copy.
    pub fn load() -> Result<Self> {
        match paths::load_shared_yaml("providers.yaml") {
            Some(yaml) => match Self::from_yaml(&yaml) {
                Ok(registry) => {
                    log::debug!("Loaded {} providers from shared/", registry.len());
                    Ok(registry)
                }
                Err(e) => {
                    log::warn!("Ignoring shared/providers.yaml: {e}");
                    Self::embedded()
                }
            },
            None => Self::embedded(),
        }
    }

    pub fn providers(&self) -> &[Provider] {
        &self.providers
    }

    pub fn get(&self, key: &str) -> Option<&Provider> {
        self.providers.iter().find(|p| p.key() == key)
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

impl ProviderCatalog for ProviderRegistry {
    fn detect_all(&self, url: &str, post_data: Option<&str>) -> Vec<TrackerDetection> {
        self.providers
            .iter()
            .filter(|p| p.matches(url))
            .filter_map(|p| p.parse(url, post_data))
            .collect()
    }
}
