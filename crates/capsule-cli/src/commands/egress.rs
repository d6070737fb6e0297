use capsule_core::Allowlist;
use capsule_egress::{parse_target, EffectiveAllowlist};

/// Offline egress decision for a URL: scheme, literal address class and
/// the manifest ∩ global allowlist. No DNS lookup is made.
pub fn check(url: &str, manifest: &[String], global: &[String]) -> anyhow::Result<String> {
    let target = parse_target(url)?;
    let manifest = Allowlist::parse_all(manifest)?;
    let global = Allowlist::parse_all(global)?;
    let rule = EffectiveAllowlist::new(&manifest, &global).authorize(&target)?;
    Ok(format!("{}:{} allowed by {rule}", target.host, target.port))
}

pub fn run(url: &str, manifest: &[String], global: &[String]) -> anyhow::Result<()> {
    match check(url, manifest, global) {
        Ok(line) => {
            println!("✓ {line}");
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ {e}");
            Err(e)
        }
    }
}
