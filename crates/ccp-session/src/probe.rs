use ccp_core::schema::LinuxProcessStats;
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};

#[derive(Debug, Clone, Copy, Default)]
pub struct ProbeReading {
    pub cpu_percent: Option<f64>,
    pub rss_bytes: Option<u64>,
}

/// Cross-platform CPU/RSS capability. Platform-specific counters come
/// from a separate [`ExtrasProbe`] capability instead of widening this
/// trait.
pub trait BasicProbe: Send {
    fn sample(&mut self, pid: u32) -> Result<ProbeReading, String>;
}

pub trait ExtrasProbe: Send {
    fn sample(&mut self, pid: u32) -> Option<LinuxProcessStats>;
}

/// sysinfo-backed probe. CPU percent is a delta between consecutive
/// refreshes, so the first sample of a session reads near zero.
pub struct SysinfoProbe {
    system: System,
}

impl SysinfoProbe {
    pub fn new() -> Self {
        Self {
            system: System::new(),
        }
    }
}

impl Default for SysinfoProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl BasicProbe for SysinfoProbe {
    fn sample(&mut self, pid: u32) -> Result<ProbeReading, String> {
        let target = Pid::from_u32(pid);
        self.system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[target]),
            true,
            ProcessRefreshKind::new().with_cpu().with_memory(),
        );
        let process = self
            .system
            .process(target)
            .ok_or_else(|| format!("process {pid} not found"))?;
        Ok(ProbeReading {
            cpu_percent: Some(f64::from(process.cpu_usage())),
            rss_bytes: Some(process.memory()),
        })
    }
}

/// Linux extras read from `/proc/<pid>`: fault and context-switch
/// counters, open descriptors, thread count.
#[cfg(target_os = "linux")]
pub struct ProcExtrasProbe;

#[cfg(target_os = "linux")]
impl ExtrasProbe for ProcExtrasProbe {
    fn sample(&mut self, pid: u32) -> Option<LinuxProcessStats> {
        linux::read_proc_stats(pid)
    }
}

pub fn default_probes() -> (Box<dyn BasicProbe>, Option<Box<dyn ExtrasProbe>>) {
    let basic: Box<dyn BasicProbe> = Box::new(SysinfoProbe::new());
    #[cfg(target_os = "linux")]
    let extras: Option<Box<dyn ExtrasProbe>> = Some(Box::new(ProcExtrasProbe));
    #[cfg(not(target_os = "linux"))]
    let extras: Option<Box<dyn ExtrasProbe>> = None;
    (basic, extras)
}

#[cfg(target_os = "linux")]
mod linux {
    use ccp_core::schema::LinuxProcessStats;
    use std::fs;

    pub fn read_proc_stats(pid: u32) -> Option<LinuxProcessStats> {
        let stat = fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
        let status = fs::read_to_string(format!("/proc/{pid}/status")).ok()?;

        let (minor_faults, major_faults, threads) = parse_stat(&stat)?;
        let (voluntary, involuntary) = parse_status(&status);
        let open_fds = fs::read_dir(format!("/proc/{pid}/fd"))
            .map(|entries| entries.count() as u32)
            .unwrap_or(0);

        Some(LinuxProcessStats {
            minor_faults,
            major_faults,
            voluntary_ctxt_switches: voluntary,
            involuntary_ctxt_switches: involuntary,
            open_fds,
            threads,
        })
    }

    /// `/proc/<pid>/stat` fields after the parenthesized comm, which may
    /// itself contain spaces. Field numbering follows proc(5): minflt is
    /// field 10, majflt field 12, num_threads field 20.
    fn parse_stat(stat: &str) -> Option<(u64, u64, u32)> {
        let after_comm = &stat[stat.rfind(')')? + 1..];
        let fields: Vec<&str> = after_comm.split_whitespace().collect();
        // `fields[0]` is field 3 (state).
        let minor_faults = fields.get(7)?.parse().ok()?;
        let major_faults = fields.get(9)?.parse().ok()?;
        let threads = fields.get(17)?.parse().ok()?;
        Some((minor_faults, major_faults, threads))
    }

    fn parse_status(status: &str) -> (u64, u64) {
        let mut voluntary = 0;
        let mut involuntary = 0;
        for line in status.lines() {
            if let Some(rest) = line.strip_prefix("voluntary_ctxt_switches:") {
                voluntary = rest.trim().parse().unwrap_or(0);
            } else if let Some(rest) = line.strip_prefix("nonvoluntary_ctxt_switches:") {
                involuntary = rest.trim().parse().unwrap_or(0);
            }
        }
        (voluntary, involuntary)
    }

}
