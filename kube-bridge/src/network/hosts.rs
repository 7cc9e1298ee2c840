//! Hosts file entries for allocated endpoints

use crate::Result;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Mutex;
use tracing::debug;

/// Name resolution for allocated endpoint IPs.
pub trait HostsFileManager: Send + Sync + std::fmt::Debug {
    /// Register `name -> ip` entries.
    fn add(&self, entries: &[(IpAddr, String)]) -> Result<()>;

    /// Drop every entry pointing at one of `ips`.
    fn remove(&self, ips: &[IpAddr]) -> Result<()>;

    /// Drop every entry this manager ever wrote.
    fn clear(&self) -> Result<()>;
}

/// Location of the OS hosts file.
pub fn system_hosts_path() -> PathBuf {
    if cfg!(windows) {
        PathBuf::from(r"C:\Windows\System32\drivers\etc\hosts")
    } else {
        PathBuf::from("/etc/hosts")
    }
}

/// Leaves name resolution alone.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoHostsFile;

impl HostsFileManager for NoHostsFile {
    fn add(&self, _entries: &[(IpAddr, String)]) -> Result<()> {
        Ok(())
    }

    fn remove(&self, _ips: &[IpAddr]) -> Result<()> {
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        Ok(())
    }
}

/// Marker appended to every line we own
const MARKER: &str = "# kube-bridge";

/// Edits a hosts file in place, touching only lines tagged with a marker comment.
#[derive(Debug)]
pub struct MarkedHostsFile {
    path: PathBuf,
    lock: Mutex<()>,
}

impl MarkedHostsFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    /// Rewrite the file keeping lines for which `keep` returns true.
    fn rewrite(&self, keep: impl Fn(&str) -> bool, extra: &[String]) -> Result<()> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(e.into()),
        };

        let mut out: Vec<&str> = content.lines().filter(|line| keep(line)).collect();
        out.extend(extra.iter().map(String::as_str));

        let mut text = out.join("\n");
        if !text.is_empty() {
            text.push('\n');
        }
        std::fs::write(&self.path, text)?;
        Ok(())
    }
}

fn owned_line_ip(line: &str) -> Option<IpAddr> {
    if !line.trim_end().ends_with(MARKER) {
        return None;
    }
    line.split_whitespace().next()?.parse().ok()
}

impl HostsFileManager for MarkedHostsFile {
    fn add(&self, entries: &[(IpAddr, String)]) -> Result<()> {
        let names: Vec<&str> = entries.iter().map(|(_, name)| name.as_str()).collect();
        let lines: Vec<String> = entries
            .iter()
            .map(|(ip, name)| format!("{} {} {}", ip, name, MARKER))
            .collect();

        // a re-added name replaces its previous entry
        self.rewrite(
            |line| {
                owned_line_ip(line).is_none()
                    || !line.split_whitespace().nth(1).is_some_and(|n| names.contains(&n))
            },
            &lines,
        )?;
        debug!("Added {} hosts entries to {}", entries.len(), self.path.display());
        Ok(())
    }

    fn remove(&self, ips: &[IpAddr]) -> Result<()> {
        self.rewrite(
            |line| owned_line_ip(line).map_or(true, |ip| !ips.contains(&ip)),
            &[],
        )
    }

    fn clear(&self) -> Result<()> {
        self.rewrite(|line| owned_line_ip(line).is_none(), &[])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn ip(last: u8) -> IpAddr {
        Ipv4Addr::new(127, 1, 1, last).into()
    }

    #[test]
    fn add_remove_clear_only_touch_owned_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hosts");
        std::fs::write(&path, "127.0.0.1 localhost\n").unwrap();
        let hosts = MarkedHostsFile::new(&path);

        hosts
            .add(&[(ip(1), "orders".into()), (ip(2), "payments".into())])
            .unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.starts_with("127.0.0.1 localhost\n"));
        assert!(content.contains("127.1.1.1 orders # kube-bridge"));
        assert!(content.contains("127.1.1.2 payments # kube-bridge"));

        hosts.remove(&[ip(1)]).unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(!content.contains("orders"));
        assert!(content.contains("payments"));

        hosts.clear().unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "127.0.0.1 localhost\n");
    }

    #[test]
    fn re_adding_a_name_replaces_it() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hosts");
        let hosts = MarkedHostsFile::new(&path);

        hosts.add(&[(ip(1), "orders".into())]).unwrap();
        hosts.add(&[(ip(3), "orders".into())]).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content, "127.1.1.3 orders # kube-bridge\n");
    }
}
