//! Agent secret provisioning.

use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use rand::distributions::Alphanumeric;
use rand::Rng;

use havoc::protocol::key_digest;

const SECRET_LEN: usize = 32;

pub const DEFAULT_KEY_FILE: &str = "/etc/havoc/agent.key";

/// Expand `~` in a key-file path.
pub fn expand_path(raw: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(raw).into_owned())
}

pub fn generate() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(SECRET_LEN)
        .map(char::from)
        .collect()
}

/// Write a fresh secret to `path` (mode 0600) and return it.
pub fn write_new(path: &Path) -> Result<String> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;
    }

    let secret = generate();
    let mut options = std::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options
        .open(path)
        .with_context(|| format!("Failed to write key file {}", path.display()))?;
    file.write_all(secret.as_bytes())?;
    file.write_all(b"\n")?;

    tracing::info!("Generated new agent secret at {}", path.display());
    Ok(secret)
}

/// Read the secret stored at `path`.
pub fn load(path: &Path) -> Result<String> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read key file {}", path.display()))?;
    let secret = raw.trim();
    if secret.is_empty() {
        bail!("Key file {} is empty", path.display());
    }
    Ok(secret.to_string())
}

/// Digest of the stored secret, generating the file first if missing.
pub fn load_or_create_digest(path: &Path) -> Result<String> {
    let secret = if path.exists() {
        load(path)?
    } else {
        write_new(path)?
    };
    Ok(key_digest(&secret))
}
