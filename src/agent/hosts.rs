//! Temporary hosts-file overrides.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// The OS hosts file, guarded by a process-local lock for every
/// read-modify-write.
#[derive(Debug)]
pub struct HostsFile {
    path: PathBuf,
    lock: Mutex<()>,
}

/// What one `inject` appended, needed to take it back out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Injection {
    block: String,
    lines: Vec<String>,
}

impl HostsFile {
    pub fn system() -> Self {
        Self::at(default_hosts_path())
    }

    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append a `127.0.0.1    <name>` line for every name.
    pub fn inject(&self, names: &[String]) -> std::io::Result<Injection> {
        let lines: Vec<String> = names.iter().map(|n| format!("127.0.0.1    {}", n)).collect();
        let block: String = lines.iter().map(|l| format!("\n{}", l)).collect();

        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut file = std::fs::OpenOptions::new().append(true).open(&self.path)?;
        file.write_all(block.as_bytes())?;
        file.flush()?;

        tracing::info!("Redirected {} to localhost in {}", names.join(", "), self.path.display());
        Ok(Injection { block, lines })
    }

    /// Remove exactly what `injection` added, leaving other edits alone.
    pub fn restore(&self, injection: &Injection) -> std::io::Result<()> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let content = std::fs::read_to_string(&self.path)?;

        let restored = match content.rfind(&injection.block) {
            Some(at) => {
                let mut out = String::with_capacity(content.len() - injection.block.len());
                out.push_str(&content[..at]);
                out.push_str(&content[at + injection.block.len()..]);
                out
            }
            // Someone edited around our block; drop our lines one by one
            None => remove_lines(&content, &injection.lines),
        };

        std::fs::write(&self.path, restored)?;
        tracing::info!("Restored {}", self.path.display());
        Ok(())
    }
}

/// Drop the last occurrence of each line in `lines`.
fn remove_lines(content: &str, lines: &[String]) -> String {
    let mut kept: Vec<&str> = content.split('\n').collect();
    for line in lines {
        if let Some(i) = kept.iter().rposition(|l| l.trim_end() == line) {
            kept.remove(i);
        }
    }
    kept.join("\n")
}

#[cfg(windows)]
fn default_hosts_path() -> PathBuf {
    let root = std::env::var_os("SystemRoot").unwrap_or_else(|| "C:\\Windows".into());
    PathBuf::from(root)
        .join("System32")
        .join("drivers")
        .join("etc")
        .join("hosts")
}

#[cfg(not(windows))]
fn default_hosts_path() -> PathBuf {
    PathBuf::from("/etc/hosts")
}
