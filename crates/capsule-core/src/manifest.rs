//! Capsule manifest schema.
//!
//! A [`Manifest`] is generated fresh on every build. Archives may carry a
//! `manifest.json`, which is parsed as a [`ManifestHint`]: it seeds runner,
//! entry, capabilities and metadata, but size fields (`assets`,
//! `bundleSize`) are always derived from the final file set.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::allowlist::{Allowlist, RuleError};
use crate::types::{is_safe_relative_path, FileMap, RunnerType};

/// Schema version written into every generated manifest.
pub const MANIFEST_VERSION: u32 = 1;

#[derive(Debug, Error, PartialEq)]
pub enum ManifestError {
    #[error("manifest is not valid JSON: {0}")]
    Parse(String),
    #[error("unsupported manifest version {0}")]
    UnsupportedVersion(u32),
    #[error("invalid entry path: {0}")]
    InvalidEntry(String),
    #[error("entry {0} is not present in the bundle")]
    MissingEntry(String),
    #[error("invalid network capability: {0}")]
    InvalidNet(#[from] RuleError),
    #[error("invalid parameter {name}: {reason}")]
    InvalidParam { name: String, reason: String },
    #[error("duplicate parameter name: {0}")]
    DuplicateParam(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Capabilities {
    pub storage: bool,
    pub workers: bool,
    /// Allowlist entries as declared; parsed with [`Allowlist::parse_all`].
    #[serde(default)]
    pub net: Vec<String>,
}

impl Capabilities {
    pub fn allowlist(&self) -> Result<Allowlist, RuleError> {
        Allowlist::parse_all(&self.net)
    }
}

/// Typed parameter descriptor exposed to the viewer as a control.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ParamSpec {
    Slider {
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        label: Option<String>,
        min: f64,
        max: f64,
        #[serde(default = "default_step")]
        step: f64,
        default: f64,
    },
    Toggle {
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        label: Option<String>,
        default: bool,
    },
    Select {
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        label: Option<String>,
        options: Vec<String>,
        default: String,
    },
    Color {
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        label: Option<String>,
        default: String,
    },
    Text {
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        label: Option<String>,
        #[serde(default)]
        default: String,
    },
}

fn default_step() -> f64 {
    1.0
}

impl ParamSpec {
    pub fn name(&self) -> &str {
        match self {
            ParamSpec::Slider { name, .. }
            | ParamSpec::Toggle { name, .. }
            | ParamSpec::Select { name, .. }
            | ParamSpec::Color { name, .. }
            | ParamSpec::Text { name, .. } => name,
        }
    }

    fn validate(&self) -> Result<(), ManifestError> {
        let invalid = |reason: &str| ManifestError::InvalidParam {
            name: self.name().to_string(),
            reason: reason.to_string(),
        };
        let name = self.name();
        if name.is_empty()
            || name.len() > 64
            || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(invalid("name must be 1-64 characters of [A-Za-z0-9_-]"));
        }
        match self {
            ParamSpec::Slider {
                min,
                max,
                step,
                default,
                ..
            } => {
                if !(min.is_finite() && max.is_finite() && step.is_finite() && default.is_finite()) {
                    return Err(invalid("slider bounds must be finite"));
                }
                if min >= max {
                    return Err(invalid("min must be below max"));
                }
                if *step <= 0.0 {
                    return Err(invalid("step must be positive"));
                }
                if default < min || default > max {
                    return Err(invalid("default outside [min, max]"));
                }
            }
            ParamSpec::Select {
                options, default, ..
            } => {
                if options.is_empty() {
                    return Err(invalid("select needs at least one option"));
                }
                if !options.contains(default) {
                    return Err(invalid("default is not one of the options"));
                }
            }
            ParamSpec::Color { default, .. } => {
                let hex = default.strip_prefix('#').unwrap_or("");
                if !(hex.len() == 6 || hex.len() == 3) || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
                    return Err(invalid("color default must be #rgb or #rrggbb"));
                }
            }
            ParamSpec::Toggle { .. } | ParamSpec::Text { .. } => {}
        }
        Ok(())
    }
}

/// Path and size of one bundled file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetSummary {
    pub path: String,
    pub size: u64,
}

/// The declared contract of a runnable unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub version: u32,
    pub runner: RunnerType,
    pub entry: String,
    pub capabilities: Capabilities,
    #[serde(default)]
    pub params: Vec<ParamSpec>,
    #[serde(default)]
    pub assets: Vec<AssetSummary>,
    pub bundle_size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub license: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Capability overrides from an embedded manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct CapabilitiesHint {
    pub storage: Option<bool>,
    pub workers: Option<bool>,
    pub net: Option<Vec<String>>,
}

/// User-authored `manifest.json` found inside an archive. Unknown fields,
/// including size fields, are ignored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ManifestHint {
    pub version: Option<u32>,
    pub runner: Option<RunnerType>,
    pub entry: Option<String>,
    pub capabilities: Option<CapabilitiesHint>,
    pub params: Option<Vec<ParamSpec>>,
    pub license: Option<String>,
    pub title: Option<String>,
    pub description: Option<String>,
}

impl ManifestHint {
    /// Parse and validate an embedded manifest.
    pub fn parse(bytes: &[u8]) -> Result<Self, ManifestError> {
        let hint: ManifestHint =
            serde_json::from_slice(bytes).map_err(|e| ManifestError::Parse(e.to_string()))?;
        hint.validate()?;
        Ok(hint)
    }

    pub fn validate(&self) -> Result<(), ManifestError> {
        if let Some(v) = self.version
            && v != MANIFEST_VERSION
        {
            return Err(ManifestError::UnsupportedVersion(v));
        }
        if let Some(entry) = &self.entry {
            let normalized = entry.trim_start_matches("./");
            if !is_safe_relative_path(normalized) {
                return Err(ManifestError::InvalidEntry(entry.clone()));
            }
        }
        if let Some(net) = self.capabilities.as_ref().and_then(|c| c.net.as_ref()) {
            Allowlist::parse_all(net)?;
        }
        if let Some(params) = &self.params {
            validate_params(params)?;
        }
        Ok(())
    }

    /// Entry path with any `./` prefix removed.
    pub fn normalized_entry(&self) -> Option<String> {
        self.entry
            .as_deref()
            .map(|e| e.trim_start_matches("./").to_string())
    }
}

fn validate_params(params: &[ParamSpec]) -> Result<(), ManifestError> {
    let mut seen = std::collections::HashSet::new();
    for param in params {
        param.validate()?;
        if !seen.insert(param.name()) {
            return Err(ManifestError::DuplicateParam(param.name().to_string()));
        }
    }
    Ok(())
}

/// Inputs for [`Manifest::generate`] that come from the build, not the user.
#[derive(Debug, Clone)]
pub struct GenerateInput<'a> {
    pub runner: RunnerType,
    pub entry: &'a str,
    pub files: &'a FileMap,
    /// License detected from a license file, used when the hint has none.
    pub detected_license: Option<&'a str>,
}

impl Manifest {
    /// Merge a hint with the mandatory build-derived fields.
    pub fn generate(hint: Option<&ManifestHint>, input: GenerateInput<'_>) -> Result<Self, ManifestError> {
        let policy = input.runner.policy();
        let caps_hint = hint.and_then(|h| h.capabilities.clone()).unwrap_or_default();

        let capabilities = Capabilities {
            storage: caps_hint.storage.unwrap_or(policy.default_storage),
            workers: caps_hint.workers.unwrap_or(policy.default_workers),
            net: caps_hint.net.unwrap_or_default(),
        };

        let assets: Vec<AssetSummary> = input
            .files
            .iter()
            .map(|(path, bytes)| AssetSummary {
                path: path.clone(),
                size: bytes.len() as u64,
            })
            .collect();
        let bundle_size = assets.iter().map(|a| a.size).sum();

        let manifest = Manifest {
            version: MANIFEST_VERSION,
            runner: input.runner,
            entry: input.entry.to_string(),
            capabilities,
            params: hint.and_then(|h| h.params.clone()).unwrap_or_default(),
            assets,
            bundle_size,
            license: hint
                .and_then(|h| h.license.clone())
                .or_else(|| input.detected_license.map(String::from)),
            title: hint.and_then(|h| h.title.clone()),
            description: hint.and_then(|h| h.description.clone()),
        };
        manifest.validate(input.files)?;
        Ok(manifest)
    }

    /// Check structural invariants against the bundle it describes.
    pub fn validate(&self, files: &FileMap) -> Result<(), ManifestError> {
        if self.version != MANIFEST_VERSION {
            return Err(ManifestError::UnsupportedVersion(self.version));
        }
        if !is_safe_relative_path(&self.entry) {
            return Err(ManifestError::InvalidEntry(self.entry.clone()));
        }
        if !files.contains_key(&self.entry) {
            return Err(ManifestError::MissingEntry(self.entry.clone()));
        }
        self.capabilities.allowlist()?;
        validate_params(&self.params)
    }

    /// Canonical JSON encoding used for hashing.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        // Struct field order is fixed and assets come from an ordered map,
        // so serde_json output is stable for equal manifests.
        serde_json::to_vec(self).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn files(entries: &[(&str, &str)]) -> FileMap {
        entries
            .iter()
            .map(|(p, c)| (p.to_string(), c.as_bytes().to_vec()))
            .collect()
    }

    #[test]
    fn hint_ignores_size_fields() {
        let raw = br#"{"entry":"index.html","runner":"client-static","bundleSize":1,"assets":[]}"#;
        let hint = ManifestHint::parse(raw).unwrap();
        assert_eq!(hint.runner, Some(RunnerType::ClientStatic));

        let files = files(&[("index.html", "<html></html>"), ("app.js", "1")]);
        let manifest = Manifest::generate(
            Some(&hint),
            GenerateInput {
                runner: RunnerType::ClientStatic,
                entry: "index.html",
                files: &files,
                detected_license: None,
            },
        )
        .unwrap();
        assert_eq!(manifest.bundle_size, 14);
        assert_eq!(manifest.assets.len(), 2);
    }

    #[test]
    fn hint_rejects_bad_entry_and_net() {
        assert!(matches!(
            ManifestHint::parse(br#"{"entry":"../x.html"}"#),
            Err(ManifestError::InvalidEntry(_))
        ));
        assert!(matches!(
            ManifestHint::parse(br#"{"capabilities":{"net":["*.com"]}}"#),
            Err(ManifestError::InvalidNet(_))
        ));
        assert!(matches!(
            ManifestHint::parse(br#"{"runner":"python"}"#),
            Err(ManifestError::Parse(_))
        ));
        assert!(matches!(
            ManifestHint::parse(br#"{"version":7}"#),
            Err(ManifestError::UnsupportedVersion(7))
        ));
    }

    #[test]
    fn params_are_validated() {
        let raw = br#"{"params":[{"type":"slider","name":"speed","min":0,"max":10,"default":20}]}"#;
        assert!(matches!(
            ManifestHint::parse(raw),
            Err(ManifestError::InvalidParam { .. })
        ));

        let dup = br#"{"params":[{"type":"toggle","name":"a","default":true},{"type":"text","name":"a"}]}"#;
        assert!(matches!(
            ManifestHint::parse(dup),
            Err(ManifestError::DuplicateParam(_))
        ));

        let ok = br##"{"params":[{"type":"color","name":"tint","default":"#ff8800"},
            {"type":"select","name":"mode","options":["a","b"],"default":"b"}]}"##;
        assert_eq!(ManifestHint::parse(ok).unwrap().params.unwrap().len(), 2);
    }

    #[test]
    fn generate_uses_tier_defaults_and_detected_license() {
        let files = files(&[("src/App.tsx", "export default () => null")]);
        let manifest = Manifest::generate(
            None,
            GenerateInput {
                runner: RunnerType::ReactComponent,
                entry: "src/App.tsx",
                files: &files,
                detected_license: Some("MIT"),
            },
        )
        .unwrap();
        assert!(manifest.capabilities.storage);
        assert!(!manifest.capabilities.workers);
        assert_eq!(manifest.license.as_deref(), Some("MIT"));
        assert_eq!(manifest.version, MANIFEST_VERSION);
    }

    #[test]
    fn generate_requires_entry_in_bundle() {
        let files = files(&[("index.html", "")]);
        let err = Manifest::generate(
            None,
            GenerateInput {
                runner: RunnerType::ClientStatic,
                entry: "main.html",
                files: &files,
                detected_license: None,
            },
        )
        .unwrap_err();
        assert_eq!(err, ManifestError::MissingEntry("main.html".into()));
    }

    #[test]
    fn json_uses_camel_case_bundle_size() {
        let files = files(&[("index.html", "x")]);
        let manifest = Manifest::generate(
            None,
            GenerateInput {
                runner: RunnerType::ClientStatic,
                entry: "index.html",
                files: &files,
                detected_license: None,
            },
        )
        .unwrap();
        let value = serde_json::to_value(&manifest).unwrap();
        assert_eq!(value["bundleSize"], 1);
        assert_eq!(value["capabilities"]["net"], serde_json::json!([]));
        assert_eq!(value["runner"], "client-static");
    }
}
