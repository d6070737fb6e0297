use std::path::Path;

use capsule_core::CapsuleConfig;

/// Write a capsule.toml with every default spelled out.
pub fn init(path: &str, force: bool) -> anyhow::Result<()> {
    let output = Path::new(path);
    if output.exists() && !force {
        anyhow::bail!("{} already exists (use --force to overwrite)", output.display());
    }
    std::fs::write(output, CapsuleConfig::default().to_toml_string()?)?;
    println!("✓ Generated {}", output.display());
    Ok(())
}

/// Parse and validate a config file.
pub fn check(path: &str) -> anyhow::Result<()> {
    let config = CapsuleConfig::from_file(Path::new(path))?;
    println!("✓ {path} is valid");
    println!("  listen:           {}", config.server.listen);
    println!("  egress allowlist: {} rule(s)", config.egress.allowlist.len());
    println!("  jwks:             {}", config.jwks_url());
    Ok(())
}
