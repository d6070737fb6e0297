//! Safety scanner.
//!
//! Rules are matched against text files, binary file headers and the
//! manifest's declared network capability. Matching is best-effort and
//! conservative: a hit quarantines for review, it does not delete.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::net::IpAddr;
use std::sync::LazyLock;

use capsule_core::{FileMap, Quarantine, QuarantineSource};

/// Text files larger than this are only checked for binary headers.
const MAX_TEXT_SCAN_BYTES: usize = 4 * 1024 * 1024;

struct ContentRule {
    code: &'static str,
    pattern: Regex,
}

impl ContentRule {
    fn new(code: &'static str, pattern: &str) -> Self {
        Self {
            code,
            pattern: Regex::new(pattern).expect("safety rule pattern"),
        }
    }
}

static CONTENT_RULES: LazyLock<Vec<ContentRule>> = LazyLock::new(|| {
    vec![
        // Browser miners and mining pool protocols
        ContentRule::new(
            "crypto_miner",
            r"(?i)(coinhive|coin-hive|cryptonight|cryptoloot|webminerpool|minero\.cc|stratum\+(tcp|ssl)://)",
        ),
        // Code hidden behind runtime decoding
        ContentRule::new(
            "obfuscated_eval",
            r"\beval\s*\(\s*(atob|unescape|decodeURIComponent|String\.fromCharCode)\s*\(",
        ),
        // Shipping a private key exposes it to every viewer
        ContentRule::new("private_key", r"-----BEGIN\s+(RSA\s+|EC\s+|OPENSSH\s+)?PRIVATE\s+KEY-----"),
        // Cloud metadata endpoints referenced from client code
        ContentRule::new(
            "metadata_endpoint",
            r"(169\.254\.169\.254|metadata\.google\.internal|100\.100\.100\.200)",
        ),
    ]
});

const EXECUTABLE_EXTENSIONS: &[&str] = &[".exe", ".dll", ".so", ".dylib", ".msi", ".scr", ".bat", ".cmd", ".ps1"];

/// ELF, PE, Mach-O (both endiannesses, 32/64) and universal binaries.
const EXECUTABLE_MAGIC: &[&[u8]] = &[
    b"\x7fELF",
    b"MZ",
    b"\xfe\xed\xfa\xce",
    b"\xfe\xed\xfa\xcf",
    b"\xce\xfa\xed\xfe",
    b"\xcf\xfa\xed\xfe",
    b"\xca\xfe\xba\xbe",
];

const INTERNAL_HOST_SUFFIXES: &[&str] = &[".internal", ".local", ".localhost", ".lan", ".intranet"];

/// One rule match.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SafetyHit {
    pub rule: String,
    /// File the rule matched in; `None` for manifest rules.
    pub path: Option<String>,
    pub detail: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanReport {
    pub hits: Vec<SafetyHit>,
}

impl ScanReport {
    pub fn is_clean(&self) -> bool {
        self.hits.is_empty()
    }

    /// Distinct rule codes, sorted.
    pub fn rules(&self) -> Vec<&str> {
        self.hits
            .iter()
            .map(|h| h.rule.as_str())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Quarantine metadata for a positive scan.
    pub fn quarantine(&self, now: u64) -> Option<Quarantine> {
        if self.is_clean() {
            return None;
        }
        Some(Quarantine {
            reason: self.rules().join(","),
            source: QuarantineSource::Scanner,
            quarantined_at: now,
        })
    }
}

/// Scan bundled files and the declared network capability.
pub fn scan_bundle(files: &FileMap, net: &[String]) -> ScanReport {
    let mut hits = Vec::new();

    for (path, bytes) in files {
        let lower = path.to_ascii_lowercase();
        if EXECUTABLE_EXTENSIONS.iter().any(|ext| lower.ends_with(ext))
            || EXECUTABLE_MAGIC.iter().any(|magic| bytes.starts_with(magic) && bytes.len() > 64)
        {
            hits.push(SafetyHit {
                rule: "executable_binary".into(),
                path: Some(path.clone()),
                detail: "native executable in bundle".into(),
            });
            continue;
        }
        if bytes.len() > MAX_TEXT_SCAN_BYTES {
            continue;
        }
        let Ok(text) = std::str::from_utf8(bytes) else {
            continue;
        };
        for rule in CONTENT_RULES.iter() {
            if let Some(m) = rule.pattern.find(text) {
                hits.push(SafetyHit {
                    rule: rule.code.into(),
                    path: Some(path.clone()),
                    detail: format!("matched {:?}", truncate(m.as_str(), 60)),
                });
            }
        }
    }

    for entry in net {
        if let Some(reason) = internal_net_entry(entry) {
            hits.push(SafetyHit {
                rule: "internal_network_target".into(),
                path: None,
                detail: format!("capabilities.net entry {entry} {reason}"),
            });
        }
    }

    if !hits.is_empty() {
        tracing::warn!(
            hits = hits.len(),
            rules = ?hits.iter().map(|h| h.rule.as_str()).collect::<BTreeSet<_>>(),
            "Safety scan flagged bundle"
        );
    }
    ScanReport { hits }
}

/// Net entries naming IP literals or internal-only names.
fn internal_net_entry(entry: &str) -> Option<&'static str> {
    let host = entry
        .trim()
        .trim_start_matches("https://")
        .trim_start_matches("http://")
        .trim_start_matches("*.")
        .trim_end_matches('/');
    let host = host.rsplit_once(':').map_or(host, |(h, _)| h).to_ascii_lowercase();
    if host.parse::<IpAddr>().is_ok() {
        return Some("is an IP literal");
    }
    if host == "localhost" || INTERNAL_HOST_SUFFIXES.iter().any(|s| host.ends_with(s)) {
        return Some("names an internal host");
    }
    None
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((i, _)) => &s[..i],
        None => s,
    }
}
