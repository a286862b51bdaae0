use crate::command::CommandLine;
use crate::error::{scrub, Result, StreamError, TerminationWarning};
use std::collections::VecDeque;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// stderr 尾部保留行数
const STDERR_TAIL_LINES: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Spawned,
    ConfirmedAlive,
    Dead,
}

/// 一个外部子进程的句柄
///
/// 句柄在成功 spawn 后创建，终止后丢弃，从不复用。
pub struct ProcessHandle {
    child: Child,
    pid: u32,
    program: String,
    display: String,
    started_at: Instant,
    liveness: Liveness,
    stderr_tail: Arc<Mutex<VecDeque<String>>>,
    drain: Option<JoinHandle<()>>,
}

impl ProcessHandle {
    /// 按参数向量启动进程（不经过 shell）
    ///
    /// stdout 丢弃；stderr 由后台任务持续读取，避免管道写满阻塞子进程。
    pub fn spawn(cmd: &CommandLine) -> Result<Self> {
        let program = cmd.program_name();
        let shown = cmd.redacted();

        let mut command = Command::new(cmd.program());
        command
            .args(cmd.get_args())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|e| {
            let reason = match e.kind() {
                std::io::ErrorKind::NotFound => {
                    format!("tool missing: {} not found", cmd.program().display())
                }
                std::io::ErrorKind::PermissionDenied => {
                    format!("tool misconfigured: {} is not executable", cmd.program().display())
                }
                _ => e.to_string(),
            };
            StreamError::spawn(&program, reason)
        })?;

        let Some(pid) = child.id() else {
            return Err(StreamError::spawn(&program, "process exited before a pid was assigned"));
        };

        let stderr_tail = Arc::new(Mutex::new(VecDeque::with_capacity(STDERR_TAIL_LINES)));
        let drain = child.stderr.take().map(|stderr| {
            let tail = stderr_tail.clone();
            let label = program.clone();
            let secrets = cmd.secrets().to_vec();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    // 工具会回显带密码的参数（如 ffmpeg 打印输出 URL）
                    let line = scrub(&line, &secrets);
                    debug!("[{} {}] {}", label, pid, line);
                    let mut buf = tail.lock().unwrap();
                    if buf.len() == STDERR_TAIL_LINES {
                        buf.pop_front();
                    }
                    buf.push_back(line);
                }
            })
        });

        info!("Spawned {} (pid {}): {}", program, pid, shown);

        Ok(Self {
            child,
            pid,
            program,
            display: shown,
            started_at: Instant::now(),
            liveness: Liveness::Spawned,
            stderr_tail,
            drain,
        })
    }

    /// 启动宽限检查：在 `grace` 内退出视为启动失败
    ///
    /// 等待基于 `tokio::time::timeout`，调用方被取消时不会留下半完成的状态；
    /// 失败时子进程已被回收。
    pub async fn confirm_startup(&mut self, grace: Duration) -> Result<()> {
        match tokio::time::timeout(grace, self.child.wait()).await {
            Err(_) => {
                self.liveness = Liveness::ConfirmedAlive;
                Ok(())
            }
            Ok(status) => {
                self.liveness = Liveness::Dead;
                let status = status
                    .map(|s| s.to_string())
                    .unwrap_or_else(|e| format!("wait failed: {}", e));
                let mut tail = self.collect_stderr().await;
                if tail.is_empty() {
                    tail = format!("process terminated immediately ({})", status);
                }
                Err(StreamError::StartupTimeout {
                    program: self.program.clone(),
                    tail,
                })
            }
        }
    }

    /// 非阻塞存活检查
    pub fn is_alive(&mut self) -> bool {
        if self.liveness == Liveness::Dead {
            return false;
        }
        match self.child.try_wait() {
            Ok(None) => true,
            Ok(Some(status)) => {
                debug!("{} (pid {}) exited with {}", self.program, self.pid, status);
                self.liveness = Liveness::Dead;
                false
            }
            Err(e) => {
                warn!("Process monitor error [{} {}]: {}", self.program, self.pid, e);
                false
            }
        }
    }

    /// 先 SIGTERM，超时后 SIGKILL，返回前总会回收子进程
    pub async fn terminate(mut self, grace: Duration) -> Option<TerminationWarning> {
        let pid = self.pid;

        if !self.is_alive() {
            let message = format!("{} had already exited", self.program);
            warn!("Termination warning: pid {}: {}", pid, message);
            return Some(TerminationWarning {
                pid: Some(pid),
                message,
            });
        }

        #[cfg(unix)]
        {
            use nix::sys::signal::{kill, Signal};
            use nix::unistd::Pid;

            if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                debug!("SIGTERM to pid {} failed: {}", pid, e);
            }
        }
        #[cfg(not(unix))]
        {
            let _ = self.child.start_kill();
        }

        let warning = match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => {
                info!("{} (pid {}) stopped: {}", self.program, pid, status);
                None
            }
            Ok(Err(e)) => Some(TerminationWarning {
                pid: Some(pid),
                message: format!("wait failed: {}", e),
            }),
            Err(_) => {
                warn!(
                    "{} (pid {}) did not exit within {:?}, forcing kill",
                    self.program, pid, grace
                );
                // kill() 发送 SIGKILL 并等待回收
                self.child.kill().await.err().map(|e| TerminationWarning {
                    pid: Some(pid),
                    message: format!("kill failed: {}", e),
                })
            }
        };

        self.liveness = Liveness::Dead;
        if let Some(drain) = self.drain.take() {
            drain.abort();
        }
        if let Some(w) = &warning {
            warn!("Termination warning: {}", w);
        }
        warning
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// Redacted command line.
    pub fn command(&self) -> &str {
        &self.display
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    async fn collect_stderr(&mut self) -> String {
        if let Some(drain) = self.drain.take() {
            // 进程已退出，管道在 EOF 后很快关闭
            let _ = tokio::time::timeout(Duration::from_millis(500), drain).await;
        }
        let tail = self.stderr_tail.lock().unwrap();
        tail.iter().cloned().collect::<Vec<_>>().join("\n")
    }
}
