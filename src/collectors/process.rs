use super::network::read_socket_tables;
use super::{bytes_to_mb, round_to, Source, SourceKind};
use crate::snapshot::{ProcessEntry, ProcessRankings};
use std::collections::HashSet;
#[cfg(target_os = "linux")]
use std::fs;
use std::io;
use sysinfo::{PidExt, Process, ProcessExt, ProcessStatus, System, SystemExt};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum InspectError {
    #[error("process {0} is a zombie")]
    Zombie(u32),
    #[error("process {pid}: {source}")]
    Io { pid: u32, source: io::Error },
}

/// Top-N processes by CPU, memory, open inet connections and cumulative
/// disk I/O.
///
/// Per-process CPU is a delta against the previous refresh, so the reading
/// right after construction may be zero for everything.
pub struct ProcessAdapter {
    system: System,
    limit: usize,
}

impl ProcessAdapter {
    pub fn new(limit: usize) -> Self {
        let mut system = System::new();
        system.refresh_memory();
        system.refresh_processes();
        Self { system, limit }
    }

    fn live_processes(&self) -> impl Iterator<Item = Result<&Process, InspectError>> + '_ {
        self.system.processes().values().map(|p| {
            if matches!(p.status(), ProcessStatus::Zombie) {
                Err(InspectError::Zombie(p.pid().as_u32()))
            } else {
                Ok(p)
            }
        })
    }

    fn rank_by(&self, metric: impl Fn(&Process) -> f64) -> Vec<ProcessEntry> {
        rank_top(
            self.live_processes().map(|p| p.map(|p| entry(p, metric(p)))),
            self.limit,
        )
    }

    fn rank_by_connections(&self) -> Vec<ProcessEntry> {
        let inet: HashSet<u64> = match read_socket_tables() {
            Ok(sockets) => sockets.into_iter().map(|s| s.inode).collect(),
            Err(err) => {
                debug!(error = %err, "per-process connection ranking skipped");
                return Vec::new();
            }
        };

        let candidates = self.live_processes().map(|p| -> Result<ProcessEntry, InspectError> {
            let p = p?;
            let pid = p.pid().as_u32();
            let owned = socket_inodes(pid).map_err(|source| InspectError::Io { pid, source })?;
            let count = owned.iter().filter(|inode| inet.contains(*inode)).count();
            Ok(entry(p, count as f64))
        });
        rank_top(candidates.filter(non_zero), self.limit)
    }
}

impl Source for ProcessAdapter {
    type Reading = ProcessRankings;

    fn kind(&self) -> SourceKind {
        SourceKind::Process
    }

    fn sample(&mut self) -> ProcessRankings {
        self.system.refresh_memory();
        self.system.refresh_processes();
        let total_memory = self.system.total_memory() as f64;

        let cpu_top = self.rank_by(|p| round_to(p.cpu_usage() as f64, 1));
        let mem_top = self.rank_by(|p| {
            if total_memory > 0.0 {
                round_to(p.memory() as f64 / total_memory * 100.0, 1)
            } else {
                0.0
            }
        });
        let disk_top = rank_top(
            self.live_processes()
                .map(|p| {
                    p.map(|p| {
                        let usage = p.disk_usage();
                        entry(
                            p,
                            bytes_to_mb(usage.total_read_bytes + usage.total_written_bytes),
                        )
                    })
                })
                .filter(non_zero),
            self.limit,
        );
        let net_top = self.rank_by_connections();

        ProcessRankings {
            cpu_top,
            mem_top,
            disk_top,
            net_top,
        }
    }
}

fn entry(p: &Process, value: f64) -> ProcessEntry {
    ProcessEntry {
        pid: p.pid().as_u32(),
        name: p.name().to_string(),
        value,
    }
}

fn non_zero(candidate: &Result<ProcessEntry, InspectError>) -> bool {
    !matches!(candidate, Ok(e) if e.value <= 0.0)
}

/// Drops candidates that failed inspection, sorts the rest by value
/// descending and keeps the first `limit`.
pub fn rank_top(
    candidates: impl IntoIterator<Item = Result<ProcessEntry, InspectError>>,
    limit: usize,
) -> Vec<ProcessEntry> {
    let mut ranked: Vec<ProcessEntry> = candidates
        .into_iter()
        .filter_map(|c| match c {
            Ok(e) => Some(e),
            Err(err) => {
                debug!(error = %err, "skipping process");
                None
            }
        })
        .collect();
    ranked.sort_by(|a, b| b.value.total_cmp(&a.value).then(a.pid.cmp(&b.pid)));
    ranked.truncate(limit);
    ranked
}

/// Parses a `/proc/<pid>/fd/*` link target such as `socket:[12345]`.
pub fn parse_socket_link(target: &str) -> Option<u64> {
    target
        .strip_prefix("socket:[")?
        .strip_suffix(']')?
        .parse()
        .ok()
}

#[cfg(target_os = "linux")]
fn socket_inodes(pid: u32) -> io::Result<Vec<u64>> {
    let mut out = Vec::new();
    for fd in fs::read_dir(format!("/proc/{pid}/fd"))? {
        let Ok(fd) = fd else {
            continue;
        };
        if let Ok(target) = fs::read_link(fd.path()) {
            if let Some(inode) = parse_socket_link(&target.to_string_lossy()) {
                out.push(inode);
            }
        }
    }
    Ok(out)
}

#[cfg(not(target_os = "linux"))]
fn socket_inodes(_pid: u32) -> io::Result<Vec<u64>> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "per-process sockets not exposed on this platform",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ok(pid: u32, value: f64) -> Result<ProcessEntry, InspectError> {
        Ok(ProcessEntry {
            pid,
            name: format!("proc{pid}"),
            value,
        })
    }

    #[test]
    fn ranks_descending_and_truncates() {
        let ranked = rank_top(
            vec![ok(1, 3.0), ok(2, 9.5), ok(3, 0.1), ok(4, 7.0), ok(5, 9.5), ok(6, 1.0)],
            5,
        );
        let pids: Vec<u32> = ranked.iter().map(|e| e.pid).collect();
        assert_eq!(pids, vec![2, 5, 4, 1, 6]);
    }

    #[test]
    fn inspection_failures_are_skipped() {
        let ranked = rank_top(
            vec![
                ok(1, 2.0),
                Err(InspectError::Zombie(2)),
                Err(InspectError::Io {
                    pid: 3,
                    source: io::Error::new(io::ErrorKind::PermissionDenied, "denied"),
                }),
                ok(4, 5.0),
            ],
            5,
        );
        let pids: Vec<u32> = ranked.iter().map(|e| e.pid).collect();
        assert_eq!(pids, vec![4, 1]);
    }

    #[test]
    fn non_zero_filter_keeps_errors_for_logging() {
        assert!(!non_zero(&ok(1, 0.0)));
        assert!(non_zero(&ok(1, 0.5)));
        assert!(non_zero(&Err(InspectError::Zombie(9))));
    }

    #[test]
    fn parses_socket_links() {
        assert_eq!(parse_socket_link("socket:[4242]"), Some(4242));
        assert_eq!(parse_socket_link("pipe:[4242]"), None);
        assert_eq!(parse_socket_link("/dev/null"), None);
    }

    #[test]
    fn live_sample_respects_limit() {
        let mut adapter = ProcessAdapter::new(3);
        let rankings = adapter.sample();
        assert!(rankings.cpu_top.len() <= 3);
        assert!(rankings.mem_top.len() <= 3);
        assert!(rankings.disk_top.len() <= 3);
        assert!(rankings.net_top.len() <= 3);
        assert!(rankings
            .mem_top
            .windows(2)
            .all(|w| w[0].value >= w[1].value));
    }
}
