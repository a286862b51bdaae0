//! OS process-table scans used for status reporting and orphan cleanup.

use std::path::Path;
use std::time::Duration;
use sysinfo::{Pid, ProcessRefreshKind, Signal, System, UpdateKind};
use tracing::{debug, info, warn};

/// Linux truncates `comm` to 15 bytes.
const COMM_LEN: usize = 15;

/// How a process is recognised as belonging to one stream kind.
///
/// Both the program name and an argument marker must match, so an unrelated
/// ffmpeg on the same host is never picked up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessSignature {
    program: String,
    marker: ArgMarker,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArgMarker {
    /// Some argument contains this text.
    Contains(String),
    /// Some argument starts with `prefix` and ends with `suffix`.
    Endpoint { prefix: String, suffix: String },
}

impl ProcessSignature {
    pub fn new(program: &Path, marker: ArgMarker) -> Self {
        let program = program
            .file_name()
            .unwrap_or(program.as_os_str())
            .to_string_lossy()
            .into_owned();
        Self { program, marker }
    }

    /// `name` is the kernel's process name, `cmd` the full argv.
    pub fn matches(&self, name: &str, cmd: &[String]) -> bool {
        let Some(argv0) = cmd.first() else {
            return false;
        };
        let argv0 = Path::new(argv0)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        let comm: String = self.program.chars().take(COMM_LEN).collect();
        if argv0 != self.program && name != self.program && name != comm {
            return false;
        }

        cmd[1..].iter().any(|arg| match &self.marker {
            ArgMarker::Contains(needle) => arg.contains(needle.as_str()),
            ArgMarker::Endpoint { prefix, suffix } => {
                arg.starts_with(prefix.as_str()) && arg.ends_with(suffix.as_str())
            }
        })
    }
}

fn scan(signature: &ProcessSignature) -> Vec<u32> {
    let mut system = System::new();
    // 默认刷新不读取 argv，签名匹配需要完整命令行
    system.refresh_processes_specifics(ProcessRefreshKind::new().with_cmd(UpdateKind::Always));
    let own = std::process::id();

    let mut pids: Vec<u32> = system
        .processes()
        .iter()
        .filter(|(pid, process)| {
            pid.as_u32() != own && signature.matches(process.name(), process.cmd())
        })
        .map(|(pid, _)| pid.as_u32())
        .collect();
    pids.sort_unstable();
    pids
}

/// 扫描进程表，返回匹配签名的 pid（升序）
pub async fn find(signature: &ProcessSignature) -> Vec<u32> {
    let signature = signature.clone();
    tokio::task::spawn_blocking(move || scan(&signature))
        .await
        .unwrap_or_else(|e| {
            warn!("Process scan failed: {}", e);
            Vec::new()
        })
}

/// 终止所有匹配签名的孤儿进程，返回被发送信号的 pid
///
/// 这些进程不是本进程的子进程，无需回收；先 SIGTERM，宽限期后仍存活则 SIGKILL。
pub async fn terminate_matching(signature: &ProcessSignature, grace: Duration) -> Vec<u32> {
    let pids = find(signature).await;
    if pids.is_empty() {
        return pids;
    }

    info!("Terminating {} orphaned {} process(es): {:?}", pids.len(), signature.program, pids);
    signal_all(&pids, Signal::Term);

    let deadline = tokio::time::Instant::now() + grace;
    loop {
        let remaining: Vec<u32> = find(signature)
            .await
            .into_iter()
            .filter(|pid| pids.contains(pid))
            .collect();
        if remaining.is_empty() {
            break;
        }
        if tokio::time::Instant::now() >= deadline {
            warn!("Orphans {:?} ignored SIGTERM, sending SIGKILL", remaining);
            signal_all(&remaining, Signal::Kill);
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    pids
}

fn signal_all(pids: &[u32], signal: Signal) {
    let mut system = System::new();
    system.refresh_processes_specifics(ProcessRefreshKind::new());
    for pid in pids {
        match system.process(Pid::from_u32(*pid)) {
            Some(process) => {
                if process.kill_with(signal) != Some(true) {
                    debug!("Could not signal pid {}", pid);
                }
            }
            None => debug!("pid {} already gone", pid),
        }
    }
}
