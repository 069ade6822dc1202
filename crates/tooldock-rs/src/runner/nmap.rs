use std::{
    io::{self, BufRead, BufReader, Read},
    net::Ipv6Addr,
    path::PathBuf,
    process::{ChildStdout, Command, Stdio},
    sync::LazyLock,
    thread,
};

use ipnet::IpNet;
use regex::Regex;
use tracing::{debug, info, warn};

use crate::error::RunnerError;

use super::{ProgressEvent, ProgressSink, Runner, ScanOptions, ScanType};

static STATS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"percent="(\d+(?:\.\d+)?)"|About (\d+(?:\.\d+)?)% done"#)
        .expect("stats regex should compile")
});
static COMPLETION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"Nmap done|<runstats>").expect("completion regex should compile")
});
static HOST_DISCOVERY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)ping scan|host discovery|parallel dns resolution")
        .expect("host discovery regex should compile")
});
static PORT_SCAN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(?:syn stealth|connect|udp|ack|fin|xmas|null|window|maimon|sctp init) scan")
        .expect("port scan regex should compile")
});
static SERVICE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)service scan").expect("service regex should compile")
});
static OS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)os detection").expect("os regex should compile"));

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ScanPhase {
    #[default]
    Initializing,
    HostDiscovery,
    PortScan,
    ServiceDetection,
    OsDetection,
}

impl ScanPhase {
    pub fn label(self) -> &'static str {
        match self {
            ScanPhase::Initializing => "Initializing",
            ScanPhase::HostDiscovery => "Host discovery",
            ScanPhase::PortScan => "Port scanning",
            ScanPhase::ServiceDetection => "Service detection",
            ScanPhase::OsDetection => "OS detection",
        }
    }

    fn detect(line: &str) -> Option<ScanPhase> {
        if SERVICE_RE.is_match(line) {
            Some(ScanPhase::ServiceDetection)
        } else if OS_RE.is_match(line) {
            Some(ScanPhase::OsDetection)
        } else if PORT_SCAN_RE.is_match(line) {
            Some(ScanPhase::PortScan)
        } else if HOST_DISCOVERY_RE.is_match(line) {
            Some(ScanPhase::HostDiscovery)
        } else {
            None
        }
    }
}

// Progress only moves forward; per-task percentages cap at 99 so 100 means done.
#[derive(Debug, Clone, Default)]
pub struct ScanObserver {
    phase: ScanPhase,
    progress: u8,
    finished: bool,
}

impl ScanObserver {
    pub fn phase(&self) -> ScanPhase {
        self.phase
    }

    pub fn progress(&self) -> u8 {
        self.progress
    }

    pub fn observe(&mut self, line: &str) -> Option<ProgressEvent> {
        if self.finished {
            return None;
        }

        if COMPLETION_RE.is_match(line) {
            self.progress = 100;
            self.finished = true;
            return Some(ProgressEvent::forced(100, "Scan completed"));
        }

        let mut event = None;

        if let Some(phase) = ScanPhase::detect(line) {
            if phase != self.phase {
                self.phase = phase;
                event = Some(ProgressEvent::new(
                    self.progress,
                    format!("Entering phase: {}", phase.label()),
                ));
            }
        }

        if let Some(percent) = stats_percent(line) {
            if percent > self.progress {
                self.progress = percent;
                event = Some(ProgressEvent::new(
                    percent,
                    format!("{} - {}% complete", self.phase.label(), percent),
                ));
            }
        }

        event
    }
}

fn stats_percent(line: &str) -> Option<u8> {
    let caps = STATS_RE.captures(line)?;
    let raw = caps.get(1).or_else(|| caps.get(2))?.as_str();
    let value: f64 = raw.parse().ok()?;
    Some(value.clamp(0.0, 99.0) as u8)
}

pub fn normalize_target(target: &str) -> String {
    let trimmed = target.trim();
    let host_port = match trimmed.split_once("://") {
        Some((_, rest)) => {
            let authority = rest.split(['/', '?', '#']).next().unwrap_or_default();
            authority.rsplit('@').next().unwrap_or_default()
        }
        None => trimmed,
    };

    if let Some(bracketed) = host_port.strip_prefix('[') {
        return bracketed
            .split(']')
            .next()
            .unwrap_or_default()
            .to_string();
    }

    // a bare IPv6 address has more than one colon and no port
    match host_port.split_once(':') {
        Some((host, port)) if !port.contains(':') => host.to_string(),
        _ => host_port.to_string(),
    }
}

fn is_ipv6(target: &str) -> bool {
    target.parse::<Ipv6Addr>().is_ok() || matches!(target.parse::<IpNet>(), Ok(IpNet::V6(_)))
}

pub fn build_args(target: &str, options: &ScanOptions) -> Vec<String> {
    let mut args: Vec<String> = ["-oX", "-", "--stats-every", "5s", "-v"]
        .into_iter()
        .map(String::from)
        .collect();

    match options.scan_type {
        ScanType::Quick => args.extend(["-T4", "--top-ports", "100"].map(String::from)),
        ScanType::Default => args.extend(["-sV", "-O"].map(String::from)),
    }

    if let Some(ports) = &options.ports {
        args.push("-p".to_string());
        args.push(ports.clone());
    }

    if is_ipv6(target) {
        args.push("-6".to_string());
    }

    args.push(target.to_string());
    args
}

#[derive(Debug, Clone)]
pub struct NmapRunner {
    binary: PathBuf,
}

impl NmapRunner {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

impl Default for NmapRunner {
    fn default() -> Self {
        Self::new("nmap")
    }
}

impl Runner for NmapRunner {
    fn name(&self) -> &'static str {
        "nmap"
    }

    fn run(
        &self,
        target: &str,
        options: &ScanOptions,
        progress: &mut dyn ProgressSink,
    ) -> Result<String, RunnerError> {
        let target = normalize_target(target);
        let args = build_args(&target, options);

        info!(command = %self.binary.display(), ?args, "audit: launching external tool");
        let mut child = Command::new(&self.binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        // stderr is drained on its own thread so a chatty tool can't fill the
        // pipe and stall while we block on stdout.
        let stderr_pipe = child.stderr.take();
        let stderr_reader = thread::spawn(move || {
            let mut buf = String::new();
            if let Some(mut pipe) = stderr_pipe {
                let mut bytes = Vec::new();
                if pipe.read_to_end(&mut bytes).is_ok() {
                    buf = String::from_utf8_lossy(&bytes).into_owned();
                }
            }
            buf
        });

        let mut observer = ScanObserver::default();
        let mut output = String::new();
        let streamed = match child.stdout.take() {
            Some(stdout) => stream_stdout(stdout, &mut observer, progress, &mut output),
            None => Err(io::Error::new(io::ErrorKind::Other, "stdout was not captured")),
        };

        if let Err(err) = streamed {
            warn!(error = %err, "reading tool output failed, killing process");
            let _ = child.kill();
            let _ = child.wait();
            let _ = stderr_reader.join();
            return Err(err.into());
        }

        let status = child.wait()?;
        let stderr = stderr_reader.join().unwrap_or_default();

        if !status.success() {
            return Err(RunnerError::ExecutionFailed {
                exit_code: status.code(),
                stderr: stderr.trim().to_string(),
            });
        }

        if !stderr.trim().is_empty() {
            debug!(stderr = %stderr.trim(), "tool reported warnings");
        }

        if observer.progress() < 100 {
            progress.report(ProgressEvent::forced(100, "Scan completed"));
        }

        Ok(output)
    }
}

fn stream_stdout(
    stdout: ChildStdout,
    observer: &mut ScanObserver,
    progress: &mut dyn ProgressSink,
    output: &mut String,
) -> io::Result<()> {
    let mut reader = BufReader::new(stdout);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        if reader.read_until(b'\n', &mut buf)? == 0 {
            return Ok(());
        }
        let line = String::from_utf8_lossy(&buf);
        output.push_str(&line);
        if let Some(event) = observer.observe(&line) {
            progress.report(event);
        }
    }
}
