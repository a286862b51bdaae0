//! Stream controllers: one per stream kind, each the sole owner of its processes.

pub mod mjpeg;
pub mod rtsp;

use crate::command::CommandLine;
use crate::error::{Result, TerminationWarning};
use crate::process::ProcessHandle;
use serde::Serialize;
use std::time::Duration;
use tracing::info;

pub use mjpeg::MjpegController;
pub use rtsp::RtspController;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamState {
    Stopped,
    Starting,
    Running,
}

/// `stop()` 的结果：从不失败，只携带警告
#[derive(Debug, Default, Serialize)]
pub struct StopReport {
    pub warnings: Vec<String>,
    /// 按签名清理掉的非本控制器持有的进程
    pub orphans: Vec<u32>,
}

impl StopReport {
    fn warn(&mut self, warning: Option<TerminationWarning>) {
        if let Some(w) = warning {
            self.warnings.push(w.to_string());
        }
    }

    fn merge(&mut self, other: StopReport) {
        self.warnings.extend(other.warnings);
        self.orphans.extend(other.orphans);
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StreamStatus {
    pub running: bool,
    pub pid: Option<u32>,
}

/// 启动进程并做宽限检查
///
/// 句柄在等待之前就放入 `slot`，请求被取消时进程仍有归属；
/// 启动失败时句柄被移除（子进程已回收）。
async fn launch(slot: &mut Option<ProcessHandle>, cmd: &CommandLine, grace: Duration) -> Result<u32> {
    let handle = slot.insert(ProcessHandle::spawn(cmd)?);
    let pid = handle.pid();
    let confirmed = handle.confirm_startup(grace).await;
    match confirmed {
        Ok(()) => {
            info!("{} running (pid {}): {}", handle.program(), pid, handle.command());
            Ok(pid)
        }
        Err(e) => {
            slot.take();
            Err(e)
        }
    }
}

async fn terminate_slot(slot: &mut Option<ProcessHandle>, grace: Duration, report: &mut StopReport) {
    if let Some(handle) = slot.take() {
        report.warn(handle.terminate(grace).await);
    }
}

#[cfg(all(test, unix))]
pub(crate) mod testutil {
    use std::path::{Path, PathBuf};

    /// Runs until SIGTERM.
    pub const LONG_RUNNING: &str = "trap 'exit 0' TERM\nwhile :; do sleep 0.1; done\n";

    /// Writes an executable shell script standing in for a media tool.
    pub fn fake_tool(dir: &Path, name: &str, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{}", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }
}
