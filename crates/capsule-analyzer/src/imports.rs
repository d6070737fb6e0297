//! Import-allowlist compiler.
//!
//! Statically extracts module specifiers from JavaScript/TypeScript sources
//! (and inline `<script>` blocks in HTML) and checks each one against the
//! runner tier's [`ModuleAllowance`]. Nothing is executed. A single
//! offending import rejects the whole file set; the error lists all of them.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::LazyLock;
use thiserror::Error;

use capsule_core::{FileMap, ModuleAllowance, RunnerType};

const SCRIPT_EXTENSIONS: &[&str] = &[".js", ".mjs", ".cjs", ".jsx", ".ts", ".tsx", ".mts", ".cts"];

/// Suffixes tried, in order, when a relative specifier has no exact match.
const RESOLVE_SUFFIXES: &[&str] = &[
    ".js", ".mjs", ".jsx", ".ts", ".tsx", ".json", "/index.js", "/index.jsx", "/index.ts", "/index.tsx",
];

const NODE_BUILTINS: &[&str] = &[
    "assert", "buffer", "child_process", "cluster", "crypto", "dgram", "dns", "events", "fs", "http",
    "http2", "https", "module", "net", "os", "path", "perf_hooks", "process", "readline", "stream",
    "tls", "tty", "url", "util", "v8", "vm", "worker_threads", "zlib",
];

static STATIC_IMPORT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?:^|[^\w$.])import\s*(?:([\w$*{}\s,]+?)\s*from\s*)?["']([^"'\n]+)["']"#)
        .expect("static import pattern")
});
static RE_EXPORT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?:^|[^\w$.])export\s*(?:type\s+)?(?:\*\s*(?:as\s+[\w$]+\s*)?|\{[^}]*\}\s*)from\s*["']([^"'\n]+)["']"#)
        .expect("re-export pattern")
});
static DYNAMIC_CALL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?:^|[^\w$.])(import|require)\s*\(\s*([^)]*?)\s*\)"#).expect("dynamic call pattern")
});
static STRING_LITERAL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"^(?:"([^"$]*)"|'([^'$]*)'|`([^`$]*)`)$"#).expect("literal pattern")
});
static INLINE_SCRIPT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?is)<script\b([^>]*)>(.*?)</script\s*>"#).expect("script pattern")
});

/// Why a specifier was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationKind {
    /// Bare package not in the tier's list.
    NotAllowed,
    /// Host-process module (`fs`, `node:child_process`, …).
    HostModule,
    UrlImport,
    /// `data:`, `blob:` and other non-http schemes.
    UnsupportedScheme,
    /// Relative path with no matching file.
    Unresolved,
    EscapesRoot,
    /// `import(expr)` / `require(expr)` with a computed specifier.
    NonLiteral,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportViolation {
    pub file: String,
    pub line: usize,
    pub specifier: String,
    pub kind: ViolationKind,
}

impl fmt::Display for ImportViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self.kind {
            ViolationKind::NotAllowed => "module not allowed for this runner",
            ViolationKind::HostModule => "host module not available in the sandbox",
            ViolationKind::UrlImport => "URL imports not allowed for this runner",
            ViolationKind::UnsupportedScheme => "unsupported specifier scheme",
            ViolationKind::Unresolved => "no such file in the bundle",
            ViolationKind::EscapesRoot => "path escapes the bundle root",
            ViolationKind::NonLiteral => "computed specifier cannot be checked",
        };
        write!(f, "{}:{}: {} ({reason})", self.file, self.line, self.specifier)
    }
}

#[derive(Debug, Error)]
pub enum ImportError {
    #[error("runner {runner} rejected {} import(s): {}", .violations.len(), summarize(.violations))]
    Rejected {
        runner: RunnerType,
        violations: Vec<ImportViolation>,
    },
}

fn summarize(violations: &[ImportViolation]) -> String {
    violations
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Successful check result. Derived data: every list here comes from the
/// scanned sources, never from user input.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportReport {
    /// Distinct external package names (`pkg` or `@scope/pkg`), sorted.
    pub modules: Vec<String>,
    /// Distinct URL specifiers, sorted (only for tiers that allow them).
    pub url_modules: Vec<String>,
    /// Host modules referenced (only for tiers that allow them).
    pub builtins: Vec<String>,
    pub files_scanned: usize,
}

/// A specifier found in source, before classification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportRef {
    pub line: usize,
    /// `None` for a computed `import(expr)` / `require(expr)`.
    pub specifier: Option<String>,
    /// The raw call argument, for reporting computed specifiers.
    pub raw: String,
}

/// Check every script (and inline HTML script) in `files` for `runner`.
pub fn check_imports(files: &FileMap, runner: RunnerType) -> Result<ImportReport, ImportError> {
    let policy = runner.policy();
    let mut modules = BTreeSet::new();
    let mut url_modules = BTreeSet::new();
    let mut builtins = BTreeSet::new();
    let mut violations = Vec::new();
    let mut files_scanned = 0;

    for (path, bytes) in files {
        let refs = if is_script(path) {
            scan_source(&String::from_utf8_lossy(bytes))
        } else if is_html(path) {
            scan_html(&String::from_utf8_lossy(bytes))
        } else {
            continue;
        };
        files_scanned += 1;

        for r in refs {
            let violation = |specifier: &str, kind| ImportViolation {
                file: path.clone(),
                line: r.line,
                specifier: specifier.to_string(),
                kind,
            };
            let Some(spec) = r.specifier.as_deref() else {
                if policy.modules != ModuleAllowance::Any {
                    violations.push(violation(&r.raw, ViolationKind::NonLiteral));
                }
                continue;
            };

            match classify(spec) {
                Specifier::Relative => match resolve_relative(path, spec, files) {
                    Resolution::Found => {}
                    Resolution::Missing => violations.push(violation(spec, ViolationKind::Unresolved)),
                    Resolution::Escapes => violations.push(violation(spec, ViolationKind::EscapesRoot)),
                },
                Specifier::Url => {
                    if policy.url_imports {
                        url_modules.insert(spec.to_string());
                    } else {
                        violations.push(violation(spec, ViolationKind::UrlImport));
                    }
                }
                Specifier::OtherScheme => {
                    if policy.modules != ModuleAllowance::Any {
                        violations.push(violation(spec, ViolationKind::UnsupportedScheme));
                    }
                }
                Specifier::Builtin(name) => {
                    if policy.modules == ModuleAllowance::Any {
                        builtins.insert(name);
                    } else {
                        violations.push(violation(spec, ViolationKind::HostModule));
                    }
                }
                Specifier::Package(name) => {
                    if policy.modules.permits(&name) {
                        modules.insert(name);
                    } else {
                        violations.push(violation(spec, ViolationKind::NotAllowed));
                    }
                }
            }
        }
    }

    if !violations.is_empty() {
        tracing::warn!(runner = %runner, count = violations.len(), "Import check rejected sources");
        return Err(ImportError::Rejected { runner, violations });
    }

    tracing::debug!(runner = %runner, files_scanned, modules = modules.len(), "Import check passed");
    Ok(ImportReport {
        modules: modules.into_iter().collect(),
        url_modules: url_modules.into_iter().collect(),
        builtins: builtins.into_iter().collect(),
        files_scanned,
    })
}

/// Extract specifiers from one JavaScript/TypeScript source.
pub fn scan_source(source: &str) -> Vec<ImportRef> {
    let code = strip_comments(source);
    let line_of = |offset: usize| code[..offset].matches('\n').count() + 1;
    let mut refs = Vec::new();

    for caps in STATIC_IMPORT.captures_iter(&code) {
        if caps
            .get(1)
            .is_some_and(|clause| clause.as_str().trim_start().starts_with("type "))
        {
            continue;
        }
        let spec = &caps[2];
        refs.push(ImportRef {
            line: line_of(caps.get(2).map_or(0, |m| m.start())),
            specifier: Some(spec.to_string()),
            raw: spec.to_string(),
        });
    }
    for caps in RE_EXPORT.captures_iter(&code) {
        let m = caps.get(1).map_or((0, ""), |m| (m.start(), m.as_str()));
        refs.push(ImportRef {
            line: line_of(m.0),
            specifier: Some(m.1.to_string()),
            raw: m.1.to_string(),
        });
    }
    for caps in DYNAMIC_CALL.captures_iter(&code) {
        let arg = caps.get(2).map_or("", |m| m.as_str());
        let start = caps.get(1).map_or(0, |m| m.start());
        let specifier = STRING_LITERAL.captures(arg).and_then(|lit| {
            lit.get(1)
                .or_else(|| lit.get(2))
                .or_else(|| lit.get(3))
                .map(|m| m.as_str().to_string())
        });
        refs.push(ImportRef {
            line: line_of(start),
            specifier,
            raw: format!("{}({arg})", &caps[1]),
        });
    }

    refs.sort_by_key(|r| r.line);
    refs
}

/// Scan inline `<script>` bodies; `src=` attributes are left alone.
fn scan_html(html: &str) -> Vec<ImportRef> {
    let mut refs = Vec::new();
    for caps in INLINE_SCRIPT.captures_iter(html) {
        let Some(body) = caps.get(2) else { continue };
        let attrs = caps.get(1).map_or("", |m| m.as_str()).to_ascii_lowercase();
        if attrs.contains("application/json") || attrs.contains("importmap") {
            continue;
        }
        let offset = html[..body.start()].matches('\n').count();
        refs.extend(scan_source(body.as_str()).into_iter().map(|mut r| {
            r.line += offset;
            r
        }));
    }
    refs
}

/// Keywords after which a `/` starts a regex literal rather than a division.
const REGEX_PREFIX_KEYWORDS: &[&str] = &[
    "return", "typeof", "instanceof", "in", "of", "new", "delete", "void", "throw", "case", "do",
    "else", "yield", "await",
];

fn is_ident_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || c == '$'
}

/// Blank out `//` and `/* */` comments, preserving string literals, regex
/// literals and newlines so line numbers survive. A quote or `//` inside a
/// regex literal neither opens a string nor starts a comment.
fn strip_comments(source: &str) -> String {
    let mut out = String::with_capacity(source.len());
    let mut chars = source.chars().peekable();
    let mut quote: Option<char> = None;
    // Whether a `/` at this point would begin an expression.
    let mut regex_allowed = true;
    let mut word = String::new();

    while let Some(c) = chars.next() {
        if let Some(q) = quote {
            out.push(c);
            if c == '\\' {
                if let Some(next) = chars.next() {
                    out.push(next);
                }
            } else if c == q {
                quote = None;
            }
            continue;
        }
        if is_ident_char(c) {
            word.push(c);
            out.push(c);
            continue;
        }
        if !word.is_empty() {
            regex_allowed = REGEX_PREFIX_KEYWORDS.contains(&word.as_str());
            word.clear();
        }
        match (c, chars.peek()) {
            ('/', Some('/')) => {
                while let Some(&next) = chars.peek() {
                    if next == '\n' {
                        break;
                    }
                    chars.next();
                    out.push(' ');
                }
                out.push(' ');
            }
            ('/', Some('*')) => {
                chars.next();
                out.push_str("  ");
                let mut prev = '\0';
                for next in chars.by_ref() {
                    out.push(if next == '\n' { '\n' } else { ' ' });
                    if prev == '*' && next == '/' {
                        break;
                    }
                    prev = next;
                }
            }
            ('/', _) if regex_allowed => {
                out.push(c);
                let mut in_class = false;
                while let Some(next) = chars.next() {
                    out.push(next);
                    match next {
                        '\\' => {
                            if let Some(escaped) = chars.next() {
                                out.push(escaped);
                            }
                        }
                        '[' => in_class = true,
                        ']' => in_class = false,
                        '/' if !in_class => break,
                        '\n' => break,
                        _ => {}
                    }
                }
                regex_allowed = false;
            }
            ('"' | '\'' | '`', _) => {
                quote = Some(c);
                out.push(c);
                regex_allowed = false;
            }
            (')' | ']', _) => {
                out.push(c);
                regex_allowed = false;
            }
            _ if c.is_whitespace() => out.push(c),
            _ => {
                out.push(c);
                regex_allowed = true;
            }
        }
    }
    out
}

enum Specifier {
    Relative,
    Url,
    OtherScheme,
    Builtin(String),
    Package(String),
}

fn classify(spec: &str) -> Specifier {
    if spec.starts_with("./") || spec.starts_with("../") || (spec.starts_with('/') && !spec.starts_with("//")) {
        return Specifier::Relative;
    }
    let lower = spec.to_ascii_lowercase();
    if lower.starts_with("http://") || lower.starts_with("https://") || lower.starts_with("//") {
        return Specifier::Url;
    }
    if let Some(name) = spec.strip_prefix("node:") {
        return Specifier::Builtin(name.split('/').next().unwrap_or(name).to_string());
    }
    if spec.contains(':') {
        return Specifier::OtherScheme;
    }
    let name = package_name(spec);
    if NODE_BUILTINS.contains(&name.as_str()) {
        Specifier::Builtin(name)
    } else {
        Specifier::Package(name)
    }
}

/// `@scope/pkg/sub` → `@scope/pkg`, `pkg/sub` → `pkg`.
fn package_name(spec: &str) -> String {
    let mut parts = spec.split('/');
    match parts.next() {
        Some(scope) if scope.starts_with('@') => match parts.next() {
            Some(pkg) => format!("{scope}/{pkg}"),
            None => scope.to_string(),
        },
        Some(first) => first.to_string(),
        None => spec.to_string(),
    }
}

enum Resolution {
    Found,
    Missing,
    Escapes,
}

fn resolve_relative(importer: &str, spec: &str, files: &FileMap) -> Resolution {
    let spec = spec.split(['?', '#']).next().unwrap_or(spec);
    let mut segments: Vec<&str> = if spec.starts_with('/') {
        Vec::new()
    } else {
        importer.split('/').collect()
    };
    // Drop the importing file name.
    segments.pop();

    for seg in spec.split('/') {
        match seg {
            "" | "." => {}
            ".." => {
                if segments.pop().is_none() {
                    return Resolution::Escapes;
                }
            }
            other => segments.push(other),
        }
    }
    let base = segments.join("/");
    if base.is_empty() {
        return Resolution::Missing;
    }
    let found = files.contains_key(&base)
        || RESOLVE_SUFFIXES
            .iter()
            .any(|suffix| files.contains_key(&format!("{base}{suffix}")));
    if found { Resolution::Found } else { Resolution::Missing }
}

fn is_script(path: &str) -> bool {
    let lower = path.to_ascii_lowercase();
    !lower.ends_with(".d.ts") && SCRIPT_EXTENSIONS.iter().any(|ext| lower.ends_with(ext))
}

fn is_html(path: &str) -> bool {
    let lower = path.to_ascii_lowercase();
    lower.ends_with(".html") || lower.ends_with(".htm")
}

/// Browser import map for a checked module list, pointing each package
/// (and its subpaths) at `cdn`.
pub fn build_import_map(modules: &[String], cdn: &str) -> serde_json::Value {
    let cdn = cdn.trim_end_matches('/');
    let mut imports = serde_json::Map::new();
    for module in modules {
        imports.insert(module.clone(), format!("{cdn}/{module}").into());
        imports.insert(format!("{module}/"), format!("{cdn}/{module}/").into());
    }
    serde_json::json!({ "imports": imports })
}
