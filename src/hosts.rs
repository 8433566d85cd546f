//! Hosts file editing
//!
//! Service hostnames are made resolvable by mapping them to the loopback
//! address. Existing lines are kept verbatim; new mappings are appended and
//! the file is written once.

use crate::error::{Error, Result};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Address every service hostname is mapped to
pub const LOOPBACK: &str = "127.0.0.1";

#[cfg(not(windows))]
const SYSTEM_HOSTS_PATH: &str = "/etc/hosts";

#[cfg(windows)]
const SYSTEM_HOSTS_PATH: &str = r"C:\Windows\System32\drivers\etc\hosts";

/// Path of the system hosts file
pub fn system_path() -> PathBuf {
    PathBuf::from(SYSTEM_HOSTS_PATH)
}

pub struct HostsFile {
    path: PathBuf,
    lines: Vec<String>,
    modified: bool,
}

impl HostsFile {
    /// Read the hosts file at `path`. A missing file is treated as empty.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(source) => return Err(Error::HostsFile { path, source }),
        };

        Ok(Self {
            lines: content.lines().map(str::to_string).collect(),
            path,
            modified: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether `hostname` is already mapped to `ip`
    pub fn has(&self, ip: &str, hostname: &str) -> bool {
        self.lines.iter().any(|line| {
            let entry = line.split('#').next().unwrap_or("");
            let mut fields = entry.split_whitespace();
            match fields.next() {
                Some(addr) if addr == ip => {
                    fields.any(|name| name.eq_ignore_ascii_case(hostname))
                }
                _ => false,
            }
        })
    }

    /// Append `ip hostname` unless already present. Returns true if added.
    pub fn add(&mut self, ip: &str, hostname: &str) -> bool {
        if self.has(ip, hostname) {
            return false;
        }
        debug!(ip, hostname, "Adding hosts file entry");
        self.lines.push(format!("{} {}", ip, hostname));
        self.modified = true;
        true
    }

    pub fn is_modified(&self) -> bool {
        self.modified
    }

    /// Write the file back if anything was added
    pub fn flush(&mut self) -> Result<()> {
        if !self.modified {
            return Ok(());
        }

        let mut content = self.lines.join("\n");
        content.push('\n');
        std::fs::write(&self.path, content).map_err(|source| Error::HostsFile {
            path: self.path.clone(),
            source,
        })?;

        info!(path = %self.path.display(), "Hosts file updated");
        self.modified = false;
        Ok(())
    }
}

/// Map every hostname to the loopback address in the hosts file at `path`
pub fn ensure_mapped(path: impl AsRef<Path>, hostnames: &[String]) -> Result<usize> {
    let mut hosts = HostsFile::load(path)?;
    let added = hostnames
        .iter()
        .filter(|hostname| hosts.add(LOOPBACK, hostname))
        .count();
    debug!(path = %hosts.path().display(), added, "Hosts file entries checked");
    if hosts.is_modified() {
        hosts.flush()?;
    }
    Ok(added)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "127.0.0.1 localhost\n::1 localhost ip6-localhost\n# 127.0.0.1 commented.local\n127.0.0.1 api.local web.local # dev\n";

    fn sample_file() -> tempfile::NamedTempFile {
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), SAMPLE).unwrap();
        file
    }

    #[test]
    fn test_has() {
        let file = sample_file();
        let hosts = HostsFile::load(file.path()).unwrap();

        assert!(hosts.has("127.0.0.1", "localhost"));
        assert!(hosts.has("127.0.0.1", "web.local"));
        assert!(hosts.has("127.0.0.1", "API.local"));
        assert!(!hosts.has("127.0.0.1", "commented.local"));
        assert!(!hosts.has("127.0.0.1", "ip6-localhost"));
        assert!(!hosts.has("127.0.0.1", "dev"));
    }

    #[test]
    fn test_add_and_flush_keeps_existing_lines() {
        let file = sample_file();
        let mut hosts = HostsFile::load(file.path()).unwrap();

        assert!(!hosts.add(LOOPBACK, "api.local"));
        assert!(!hosts.is_modified());
        assert!(hosts.add(LOOPBACK, "new.local"));
        assert!(hosts.is_modified());
        hosts.flush().unwrap();

        let content = std::fs::read_to_string(file.path()).unwrap();
        assert!(content.starts_with(SAMPLE));
        assert!(content.ends_with("127.0.0.1 new.local\n"));
    }

    #[test]
    fn test_ensure_mapped_is_idempotent() {
        let file = sample_file();
        let names = vec!["api.local".to_string(), "db.local".to_string()];

        assert_eq!(ensure_mapped(file.path(), &names).unwrap(), 1);
        assert_eq!(ensure_mapped(file.path(), &names).unwrap(), 0);

        let content = std::fs::read_to_string(file.path()).unwrap();
        assert_eq!(content.matches("db.local").count(), 1);
    }

    #[test]
    fn test_missing_file_is_created() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hosts");

        assert_eq!(ensure_mapped(&path, &["api.local".to_string()]).unwrap(), 1);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "127.0.0.1 api.local\n");
    }

    #[test]
    fn test_unwritable_file_is_hosts_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing-dir").join("hosts");

        let err = ensure_mapped(&path, &["api.local".to_string()]).unwrap_err();
        assert!(matches!(err, Error::HostsFile { .. }));
    }
}
