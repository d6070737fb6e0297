use std::path::Path;

use serde::Serialize;

use capsule_analyzer::{check_imports, AnalysisWarning, ImportReport};
use capsule_core::{GenerateInput, Manifest, RunnerType};
use capsule_guard::{scan_bundle, ScanReport};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyzeReport {
    pub manifest: Manifest,
    pub entry_candidates: Vec<String>,
    pub server_paths: Vec<String>,
    pub imports: Option<ImportReport>,
    pub import_error: Option<String>,
    pub safety: ScanReport,
    pub warnings: Vec<AnalysisWarning>,
}

/// Run the offline part of a build: analysis, manifest, import check and
/// safety scan. Nothing is bundled or stored.
pub fn report(path: &Path, strip_root: bool, runner: Option<RunnerType>) -> anyhow::Result<AnalyzeReport> {
    let analysis = super::load(path, strip_root)?;
    let runner = runner.unwrap_or(analysis.runner);
    let manifest = Manifest::generate(
        analysis.hint.as_ref(),
        GenerateInput {
            runner,
            entry: &analysis.entry,
            files: &analysis.files,
            detected_license: analysis.detected_license(),
        },
    )?;
    manifest.validate(&analysis.files)?;

    let (imports, import_error) = match check_imports(&analysis.files, runner) {
        Ok(report) => (Some(report), None),
        Err(e) => (None, Some(e.to_string())),
    };
    let safety = scan_bundle(&analysis.files, &manifest.capabilities.net);

    Ok(AnalyzeReport {
        manifest,
        entry_candidates: analysis.entry_candidates,
        server_paths: analysis.server_paths,
        imports,
        import_error,
        safety,
        warnings: analysis.warnings,
    })
}

pub fn analyze(path: &str, format: &str, strip_root: bool, runner: Option<RunnerType>) -> anyhow::Result<()> {
    let report = report(Path::new(path), strip_root, runner)?;
    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&report)?),
        _ => print_text(&report),
    }
    Ok(())
}

fn print_text(report: &AnalyzeReport) {
    let m = &report.manifest;
    println!("Entry:    {}", m.entry);
    println!("Runner:   {}", m.runner);
    println!("Size:     {} bytes in {} files", m.bundle_size, m.assets.len());
    println!("License:  {}", m.license.as_deref().unwrap_or("none"));
    if !m.capabilities.net.is_empty() {
        println!("Network:  {}", m.capabilities.net.join(", "));
    }
    match (&report.imports, &report.import_error) {
        (Some(imports), _) if !imports.modules.is_empty() => {
            println!("Modules:  {}", imports.modules.join(", "));
        }
        (_, Some(err)) => println!("✗ Imports: {err}"),
        _ => {}
    }
    if report.safety.is_clean() {
        println!("✓ Safety scan clean");
    } else {
        for hit in &report.safety.hits {
            println!("✗ {}: {} ({})", hit.rule, hit.detail, hit.path.as_deref().unwrap_or("manifest"));
        }
    }
    for w in &report.warnings {
        println!("! {}: {}", w.code, w.message);
    }
}
