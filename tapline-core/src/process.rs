//! Client process attribution
//!
//! Maps the TCP port of a local client connection to the process that owns it.
//! On Linux the socket inode is found in `/proc/net/tcp{,6}` and matched against
//! the `/proc/<pid>/fd` links.

use std::fmt;

/// Process owning a client socket
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessInfo {
    pub pid: u32,
    pub name: String,
}

impl fmt::Display for ProcessInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.name, self.pid)
    }
}

/// Resolves the process bound to a local TCP port
pub trait ProcessLookup: Send + Sync {
    fn owning_process(&self, local_port: u16) -> Option<ProcessInfo>;
}

/// Lookup that never attributes
#[derive(Debug, Default, Clone, Copy)]
pub struct NoProcessLookup;

impl ProcessLookup for NoProcessLookup {
    fn owning_process(&self, _local_port: u16) -> Option<ProcessInfo> {
        None
    }
}

/// The platform's lookup, or [`NoProcessLookup`] where none exists
pub fn platform_lookup() -> std::sync::Arc<dyn ProcessLookup> {
    #[cfg(target_os = "linux")]
    {
        std::sync::Arc::new(procfs::ProcfsLookup::default())
    }
    #[cfg(not(target_os = "linux"))]
    {
        std::sync::Arc::new(NoProcessLookup)
    }
}

#[cfg(target_os = "linux")]
pub use procfs::ProcfsLookup;

#[cfg(target_os = "linux")]
mod procfs {
    use super::{ProcessInfo, ProcessLookup};
    use std::fs;
    use std::path::PathBuf;
    use tracing::trace;

    const TCP_TABLES: [&str; 2] = ["net/tcp", "net/tcp6"];

    /// procfs-backed lookup
    #[derive(Debug, Clone)]
    pub struct ProcfsLookup {
        root: PathBuf,
    }

    impl Default for ProcfsLookup {
        fn default() -> Self {
            Self {
                root: PathBuf::from("/proc"),
            }
        }
    }

    impl ProcfsLookup {
        fn socket_inode(&self, local_port: u16) -> Option<u64> {
            TCP_TABLES.iter().find_map(|table| {
                let contents = fs::read_to_string(self.root.join(table)).ok()?;
                parse_socket_inode(&contents, local_port)
            })
        }

        fn pid_for_inode(&self, inode: u64) -> Option<u32> {
            let target = format!("socket:[{}]", inode);
            let entries = fs::read_dir(&self.root).ok()?;

            for entry in entries.flatten() {
                let Some(pid) = entry
                    .file_name()
                    .to_str()
                    .and_then(|name| name.parse::<u32>().ok())
                else {
                    continue;
                };

                // Processes we cannot inspect are skipped
                let Ok(fds) = fs::read_dir(entry.path().join("fd")) else {
                    continue;
                };
                let owns = fds.flatten().any(|fd| {
                    fs::read_link(fd.path())
                        .map(|link| link.as_os_str() == target.as_str())
                        .unwrap_or(false)
                });
                if owns {
                    return Some(pid);
                }
            }
            None
        }
    }

    impl ProcessLookup for ProcfsLookup {
        fn owning_process(&self, local_port: u16) -> Option<ProcessInfo> {
            let inode = self.socket_inode(local_port)?;
            let pid = self.pid_for_inode(inode)?;
            let name = fs::read_to_string(self.root.join(pid.to_string()).join("comm"))
                .map(|s| s.trim().to_string())
                .unwrap_or_default();
            trace!(local_port, pid, name = %name, "Attributed socket to process");
            Some(ProcessInfo { pid, name })
        }
    }

    /// Finds the inode of the socket whose local port is `local_port`
    ///
    /// Lines look like
    /// `0: 0100007F:1F90 0100007F:C350 01 00000000:00000000 00:00000000 00000000 1000 0 123456 ...`.
    pub(super) fn parse_socket_inode(table: &str, local_port: u16) -> Option<u64> {
        table.lines().skip(1).find_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            let local = fields.get(1)?;
            let (_, port_hex) = local.rsplit_once(':')?;
            let port = u16::from_str_radix(port_hex, 16).ok()?;
            if port != local_port {
                return None;
            }
            let inode = fields.get(9)?.parse::<u64>().ok()?;
            // Inode 0 marks sockets in TIME_WAIT with no owner
            (inode != 0).then_some(inode)
        })
    }
}
