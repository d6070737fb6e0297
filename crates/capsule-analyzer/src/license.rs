//! Best-effort license detection.
//!
//! Classifies a license file against a small fixed set of fingerprints.
//! An unrecognized license is reported as such, never as an error.

use serde::{Deserialize, Serialize};

use capsule_core::FileMap;

/// License file found in an archive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetectedLicense {
    pub path: String,
    /// SPDX identifier, or `None` when the text matched no fingerprint.
    pub spdx: Option<String>,
}

/// (SPDX id, phrases that must all appear), checked in order.
const FINGERPRINTS: &[(&str, &[&str])] = &[
    ("AGPL-3.0", &["gnu affero general public license", "version 3"]),
    ("LGPL-3.0", &["gnu lesser general public license", "version 3"]),
    ("LGPL-2.1", &["gnu lesser general public license", "version 2.1"]),
    ("GPL-3.0", &["gnu general public license", "version 3"]),
    ("GPL-2.0", &["gnu general public license", "version 2"]),
    ("Apache-2.0", &["apache license", "version 2.0"]),
    ("MPL-2.0", &["mozilla public license", "2.0"]),
    ("MIT", &["permission is hereby granted, free of charge"]),
    ("ISC", &["permission to use, copy, modify, and/or distribute this software"]),
    ("BSD-3-Clause", &["redistribution and use in source and binary forms", "neither the name"]),
    ("BSD-2-Clause", &["redistribution and use in source and binary forms"]),
    ("Unlicense", &["this is free and unencumbered software released into the public domain"]),
    ("CC0-1.0", &["cc0 1.0 universal"]),
];

/// True for conventional license file names (`LICENSE`, `LICENCE.md`,
/// `COPYING`, `LICENSE-MIT`, …).
pub fn is_license_path(path: &str) -> bool {
    let name = path.rsplit('/').next().unwrap_or(path).to_ascii_lowercase();
    let stem = name.split('.').next().unwrap_or(&name);
    stem == "license"
        || stem == "licence"
        || stem == "copying"
        || stem.starts_with("license-")
        || stem.starts_with("licence-")
}

/// Classify license text. Whitespace is collapsed before matching.
pub fn classify(text: &str) -> Option<&'static str> {
    let normalized = text
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_ascii_lowercase();
    FINGERPRINTS
        .iter()
        .find(|(_, phrases)| phrases.iter().all(|p| normalized.contains(p)))
        .map(|(id, _)| *id)
}

/// Find the shallowest license file and classify it.
pub fn detect(files: &FileMap) -> Option<DetectedLicense> {
    let path = files
        .keys()
        .filter(|p| is_license_path(p))
        .min_by_key(|p| (p.matches('/').count(), p.len(), p.as_str()))?;
    let text = String::from_utf8_lossy(&files[path]);
    Some(DetectedLicense {
        path: path.clone(),
        spdx: classify(&text).map(String::from),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognizes_license_names() {
        assert!(is_license_path("LICENSE"));
        assert!(is_license_path("docs/LICENCE.md"));
        assert!(is_license_path("LICENSE-MIT"));
        assert!(is_license_path("COPYING"));
        assert!(!is_license_path("src/licenses.js"));
    }

    #[test]
    fn classifies_mit_with_wrapped_lines() {
        let text = "MIT License\n\nPermission is hereby granted,\n   free of charge, to any person";
        assert_eq!(classify(text), Some("MIT"));
    }

    #[test]
    fn bsd_variants_are_distinguished() {
        let two = "Redistribution and use in source and binary forms, with or without modification";
        let three = format!("{two} ... Neither the name of the copyright holder");
        assert_eq!(classify(two), Some("BSD-2-Clause"));
        assert_eq!(classify(&three), Some("BSD-3-Clause"));
    }

    #[test]
    fn lgpl_is_not_reported_as_gpl() {
        let text = "GNU LESSER GENERAL PUBLIC LICENSE Version 3, 29 June 2007";
        assert_eq!(classify(text), Some("LGPL-3.0"));
    }

    #[test]
    fn unknown_license_is_not_an_error() {
        let mut files = FileMap::new();
        files.insert("LICENSE".into(), b"All rights reserved.".to_vec());
        let detected = detect(&files).unwrap();
        assert_eq!(detected.path, "LICENSE");
        assert_eq!(detected.spdx, None);
    }

    #[test]
    fn shallowest_license_wins() {
        let mut files = FileMap::new();
        files.insert("vendor/lib/LICENSE".into(), b"Apache License Version 2.0".to_vec());
        files.insert("LICENSE.md".into(), b"Permission is hereby granted, free of charge".to_vec());
        assert_eq!(detect(&files).unwrap().spdx.as_deref(), Some("MIT"));
    }
}
