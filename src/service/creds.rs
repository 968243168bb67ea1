//! Signing key loading
//!
//! The broker nominates one key as the authorized issuer of callout
//! replies; its seed arrives in a credentials file as a labelled block:
//!
//! ```text
//! -----BEGIN USER NKEY SEED-----
//! SUACS34KUZ4WKJBBSIXVYEWC5CLMNIFWNVTSYFNJF2PTFMAXGOGYA5GLQ4
//! -----END USER NKEY SEED-----
//! ```
//!
//! The label `NKEY SEED` (without `USER`) is also accepted. The inner line
//! is the base-32 seed the Ed25519 key pair derives from. An unreadable or
//! invalid seed is a startup-fatal misconfiguration.

use std::path::Path;

use anyhow::Context as _;
use nkeys::KeyPair;

/// Load the response-signing key pair from a credentials file.
pub fn load_signing_key(path: &Path) -> anyhow::Result<KeyPair> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("reading credentials file {}", path.display()))?;
    let seed = extract_seed(&contents)
        .with_context(|| format!("no nkey seed block in {}", path.display()))?;
    KeyPair::from_seed(&seed)
        .map_err(|err| anyhow::anyhow!("invalid nkey seed in {}: {err}", path.display()))
}

/// Pull the seed out of the labelled block.
fn extract_seed(contents: &str) -> anyhow::Result<String> {
    let mut in_block = false;
    for line in contents.lines() {
        let line = line.trim();
        if line.contains("BEGIN") && line.contains("NKEY SEED") {
            in_block = true;
            continue;
        }
        if line.contains("END") && line.contains("NKEY SEED") {
            in_block = false;
            continue;
        }
        if in_block && line.starts_with('S') {
            return Ok(line.to_string());
        }
    }
    anyhow::bail!("credentials file does not contain an nkey seed block");
}
