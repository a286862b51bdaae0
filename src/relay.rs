use crate::config::RelayConfig;
use crate::error::{Result, StreamError, TerminationWarning};
use crate::stream::StreamConfig;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::io::Write;
use std::process::{Output, Stdio};
use std::time::Duration;
use tempfile::NamedTempFile;
use tokio::process::Command;
use tokio::sync::watch;
use tracing::{info, warn};

/// install/status/stop 命令的上限
const COMMAND_TIMEOUT: Duration = Duration::from_secs(10);
/// 日志只用于附加到错误里，不能拖慢失败路径
const LOG_TIMEOUT: Duration = Duration::from_secs(2);

/// 中继生命周期状态，仅由 RTSP 控制器驱动
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RelayState {
    Inactive,
    ConfiguringFiles,
    Restarting,
    WaitingReady,
    Active,
    FailedToStart,
}

/// MediaMTX configuration document.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RelayDocument {
    log_level: &'static str,
    log_destinations: Vec<&'static str>,
    rtsp_address: String,
    rtp_address: String,
    rtcp_address: String,
    hls_address: String,
    paths: BTreeMap<&'static str, PathPolicy>,
}

#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
struct PathPolicy {
    #[serde(skip_serializing_if = "Option::is_none")]
    publish_user: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    publish_pass: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    read_user: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    read_pass: Option<String>,
}

pub struct RelaySupervisor {
    config: RelayConfig,
    state: watch::Sender<RelayState>,
}

impl RelaySupervisor {
    pub fn new(config: RelayConfig) -> Self {
        Self {
            config,
            state: watch::channel(RelayState::Inactive).0,
        }
    }

    pub fn state(&self) -> RelayState {
        *self.state.borrow()
    }

    /// 状态订阅，读取时不需要持有 supervisor
    pub fn watch(&self) -> watch::Receiver<RelayState> {
        self.state.subscribe()
    }

    fn transition(&mut self, next: RelayState) {
        let current = self.state();
        if current != next {
            info!("[Relay] {:?} -> {:?}", current, next);
            self.state.send_replace(next);
        }
    }

    fn fail(&mut self, err: StreamError) -> StreamError {
        self.transition(RelayState::FailedToStart);
        err
    }

    /// 渲染中继配置文档
    pub fn render(&self, stream: &StreamConfig) -> Result<String> {
        let policy = match stream.credentials() {
            Some((user, pass)) => PathPolicy {
                publish_user: Some(user.to_string()),
                publish_pass: Some(pass.to_string()),
                read_user: Some(user.to_string()),
                read_pass: Some(pass.to_string()),
            },
            None => PathPolicy::default(),
        };

        let doc = RelayDocument {
            log_level: "info",
            log_destinations: vec!["stdout"],
            rtsp_address: format!(":{}", stream.port),
            rtp_address: format!(":{}", self.config.rtp_port),
            rtcp_address: format!(":{}", self.config.rtcp_port),
            hls_address: format!(":{}", self.config.hls_port),
            paths: BTreeMap::from([("all", policy)]),
        };
        serde_yaml::to_string(&doc)
            .map_err(|e| StreamError::dependency(format!("cannot render relay config: {}", e), ""))
    }

    /// 临时文件所在目录：直接 rename 时必须与正式配置同目录
    fn staging_dir(&self) -> PathBuf {
        if let Some(dir) = &self.config.staging_dir {
            return dir.clone();
        }
        if self.config.install_command.is_empty() {
            match self.config.config_path.parent() {
                Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
                _ => PathBuf::from("."),
            }
        } else {
            std::env::temp_dir()
        }
    }

    /// 写临时文件后整体替换正在使用的配置，从不原地覆盖
    ///
    /// 临时文件名随机、独占创建、权限 0600，无论成败都不会留在磁盘上。
    pub async fn apply_config(&mut self, stream: &StreamConfig) -> Result<()> {
        self.transition(RelayState::ConfiguringFiles);

        let doc = match self.render(stream) {
            Ok(doc) => doc,
            Err(e) => return Err(self.fail(e)),
        };
        let dir = self.staging_dir();
        let live = self.config.config_path.clone();

        let staged = match stage_private(dir.clone(), doc.into_bytes()).await {
            Ok(staged) => staged,
            Err(e) => {
                return Err(self.fail(StreamError::dependency(
                    format!("cannot stage relay config in {}: {}", dir.display(), e),
                    "",
                )))
            }
        };

        if self.config.install_command.is_empty() {
            let target = live.clone();
            let persisted = tokio::task::spawn_blocking(move || staged.persist(&target).map(|_| ()))
                .await
                .map_err(|e| e.to_string())
                .and_then(|r| r.map_err(|e| e.error.to_string()));
            if let Err(e) = persisted {
                return Err(self.fail(StreamError::dependency(
                    format!("cannot install {}: {}", live.display(), e),
                    "",
                )));
            }
        } else {
            let mut argv = self.config.install_command.clone();
            argv.push(staged.path().to_string_lossy().into_owned());
            argv.push(live.to_string_lossy().into_owned());
            let installed = run_checked(&argv, COMMAND_TIMEOUT).await;
            // staged 在此被丢弃，临时文件随之删除
            drop(staged);
            if let Err(e) = installed {
                return Err(self.fail(StreamError::dependency(
                    format!("cannot install {}", live.display()),
                    e,
                )));
            }
        }

        info!("[Relay] Configuration installed at {}", live.display());
        Ok(())
    }

    /// 重启中继并轮询直到 active 或超时；超时时附带日志尾部
    ///
    /// 重启命令本身也计入 `timeout`。
    pub async fn restart_and_wait(&mut self, timeout: Duration) -> Result<()> {
        let deadline = tokio::time::Instant::now() + timeout;
        self.transition(RelayState::Restarting);
        if let Err(stderr) = run_checked(&self.config.restart_command, timeout).await {
            let tail = self.log_tail().await;
            warn!("[Relay] Restart failed: {}. Log:\n{}", stderr, tail);
            return Err(self.fail(StreamError::dependency(
                format!("relay restart failed: {}", stderr),
                tail,
            )));
        }

        self.transition(RelayState::WaitingReady);
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if let Ok(true) = tokio::time::timeout(remaining, self.is_active()).await {
                self.transition(RelayState::Active);
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(self.config.poll_interval().min(remaining)).await;
        }

        let tail = self.log_tail().await;
        warn!("[Relay] Not active after {:?}. Log:\n{}", timeout, tail);
        Err(self.fail(StreamError::dependency(
            format!("relay did not become active within {}s", timeout.as_secs_f32()),
            tail,
        )))
    }

    /// 查询中继是否处于 active；未配置状态命令时视为 active
    pub async fn is_active(&self) -> bool {
        if self.config.status_command.is_empty() {
            return true;
        }
        match run(&self.config.status_command, COMMAND_TIMEOUT).await {
            Ok(out) => String::from_utf8_lossy(&out.stdout).trim() == "active",
            Err(_) => false,
        }
    }

    pub async fn stop(&mut self) -> Option<TerminationWarning> {
        let result = run_checked(&self.config.stop_command, COMMAND_TIMEOUT).await;
        self.transition(RelayState::Inactive);
        match result {
            Ok(()) => {
                info!("[Relay] Stopped");
                None
            }
            Err(stderr) => {
                warn!("[Relay] Stop command failed: {}", stderr);
                Some(TerminationWarning {
                    pid: None,
                    message: format!("relay stop failed: {}", stderr),
                })
            }
        }
    }

    async fn log_tail(&self) -> String {
        match run(&self.config.log_command, LOG_TIMEOUT).await {
            Ok(out) => String::from_utf8_lossy(&out.stdout).trim_end().to_string(),
            Err(e) => format!("(log unavailable: {})", e),
        }
    }
}

/// 在 `dir` 中独占创建随机命名的临时文件（0600）并写入内容
async fn stage_private(dir: PathBuf, contents: Vec<u8>) -> std::io::Result<NamedTempFile> {
    tokio::task::spawn_blocking(move || -> std::io::Result<NamedTempFile> {
        let mut staged = tempfile::Builder::new()
            .prefix(".relay-")
            .suffix(".yml")
            .tempfile_in(&dir)?;
        staged.write_all(&contents)?;
        staged.as_file().sync_all()?;
        Ok(staged)
    })
    .await
    .map_err(std::io::Error::other)?
}

/// 运行命令并收集输出；超过 `limit` 时子进程被杀掉（kill_on_drop）
async fn run(argv: &[String], limit: Duration) -> std::io::Result<Output> {
    let Some((program, args)) = argv.split_first() else {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "no command configured",
        ));
    };
    let output = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output();
    match tokio::time::timeout(limit, output).await {
        Ok(result) => result,
        Err(_) => Err(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            format!("no result within {}s", limit.as_secs_f32()),
        )),
    }
}

/// 空命令视为成功（该步骤未启用）；非零退出或超时返回错误文本
async fn run_checked(argv: &[String], limit: Duration) -> std::result::Result<(), String> {
    if argv.is_empty() {
        return Ok(());
    }
    match run(argv, limit).await {
        Ok(out) if out.status.success() => Ok(()),
        Ok(out) => {
            let stderr = String::from_utf8_lossy(&out.stderr).trim().to_string();
            Err(if stderr.is_empty() {
                format!("{} exited with {}", argv[0], out.status)
            } else {
                stderr
            })
        }
        Err(e) => Err(format!("{}: {}", argv[0], e)),
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn argv(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    fn test_config(dir: &std::path::Path) -> RelayConfig {
        RelayConfig {
            config_path: dir.join("mediamtx.yml"),
            staging_dir: None,
            install_command: Vec::new(),
            restart_command: argv(&["true"]),
            status_command: argv(&["echo", "active"]),
            stop_command: argv(&["true"]),
            log_command: argv(&["echo", "relay log line"]),
            ready_timeout_ms: 500,
            poll_interval_ms: 20,
            ..RelayConfig::default()
        }
    }

    #[test]
    fn test_render_with_and_without_auth() {
        let relay = RelaySupervisor::new(RelayConfig::default());
        let mut stream = StreamConfig::rtsp_default();
        stream.auth_username = "cam".into();
        stream.auth_password = "secret".into();

        let doc = relay.render(&stream).unwrap();
        let parsed: serde_yaml::Value = serde_yaml::from_str(&doc).unwrap();
        assert_eq!(parsed["rtspAddress"].as_str(), Some(":8554"));
        assert_eq!(parsed["rtpAddress"].as_str(), Some(":8000"));
        assert_eq!(parsed["paths"]["all"]["publishUser"].as_str(), Some("cam"));
        assert_eq!(parsed["paths"]["all"]["readPass"].as_str(), Some("secret"));

        stream.auth_enabled = false;
        let doc = relay.render(&stream).unwrap();
        let parsed: serde_yaml::Value = serde_yaml::from_str(&doc).unwrap();
        assert!(parsed["paths"]["all"].get("publishUser").is_none());
        assert!(!doc.contains("secret"));
    }

    #[tokio::test]
    async fn test_apply_config_replaces_live_file() {
        let dir = tempfile::tempdir().unwrap();
        let live = dir.path().join("mediamtx.yml");
        std::fs::write(&live, "old: true\n").unwrap();

        let mut relay = RelaySupervisor::new(test_config(dir.path()));
        relay.apply_config(&StreamConfig::rtsp_default()).await.unwrap();

        let installed = std::fs::read_to_string(&live).unwrap();
        assert!(installed.contains("rtspAddress"));
        assert!(!installed.contains("old: true"));
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name() != "mediamtx.yml")
            .collect();
        assert!(leftovers.is_empty(), "{:?}", leftovers);
        assert_eq!(relay.state(), RelayState::ConfiguringFiles);
    }

    #[tokio::test]
    async fn test_apply_config_through_install_command() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = test_config(dir.path());
        let staging = dir.path().join("staging");
        std::fs::create_dir(&staging).unwrap();
        cfg.staging_dir = Some(staging.clone());
        cfg.install_command = argv(&["cp"]);

        let mut stream = StreamConfig::rtsp_default();
        stream.auth_password = "hunter2".into();
        let mut relay = RelaySupervisor::new(cfg);
        relay.apply_config(&stream).await.unwrap();

        let installed = std::fs::read_to_string(dir.path().join("mediamtx.yml")).unwrap();
        assert!(installed.contains("hunter2"));
        // 带凭据的临时副本不会留下
        assert_eq!(std::fs::read_dir(&staging).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_failed_install_removes_staged_copy() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = test_config(dir.path());
        let staging = dir.path().join("staging");
        std::fs::create_dir(&staging).unwrap();
        cfg.staging_dir = Some(staging.clone());
        cfg.install_command = argv(&["false"]);

        let mut relay = RelaySupervisor::new(cfg);
        let err = relay.apply_config(&StreamConfig::rtsp_default()).await.unwrap_err();
        assert_eq!(err.kind(), "dependency_failure");
        assert_eq!(relay.state(), RelayState::FailedToStart);
        assert_eq!(std::fs::read_dir(&staging).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_restart_reaches_active() {
        let dir = tempfile::tempdir().unwrap();
        let mut relay = RelaySupervisor::new(test_config(dir.path()));
        relay.restart_and_wait(Duration::from_millis(500)).await.unwrap();
        assert_eq!(relay.state(), RelayState::Active);

        assert!(relay.stop().await.is_none());
        assert_eq!(relay.state(), RelayState::Inactive);
    }

    #[tokio::test]
    async fn test_restart_timeout_returns_log_tail() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = test_config(dir.path());
        cfg.status_command = argv(&["echo", "activating"]);

        let mut relay = RelaySupervisor::new(cfg);
        let err = relay.restart_and_wait(Duration::from_millis(150)).await.unwrap_err();
        assert_eq!(err.kind(), "dependency_failure");
        match err {
            StreamError::DependencyFailure { log_tail, .. } => assert_eq!(log_tail, "relay log line"),
            other => panic!("unexpected error {:?}", other),
        }
        assert_eq!(relay.state(), RelayState::FailedToStart);
    }

    #[tokio::test]
    async fn test_failed_restart_command_is_dependency_failure() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = test_config(dir.path());
        cfg.restart_command = argv(&["false"]);

        let mut relay = RelaySupervisor::new(cfg);
        let err = relay.restart_and_wait(Duration::from_millis(150)).await.unwrap_err();
        assert_eq!(err.kind(), "dependency_failure");
        assert_eq!(relay.state(), RelayState::FailedToStart);
    }

    #[tokio::test]
    async fn test_hung_restart_counts_against_ready_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = test_config(dir.path());
        cfg.restart_command = argv(&["sleep", "6"]);

        let mut relay = RelaySupervisor::new(cfg);
        let started = std::time::Instant::now();
        let err = relay.restart_and_wait(Duration::from_millis(500)).await.unwrap_err();
        assert!(started.elapsed() < Duration::from_secs(2), "{:?}", started.elapsed());
        assert_eq!(err.kind(), "dependency_failure");
        assert!(err.to_string().contains("relay restart failed"), "{}", err);
        assert_eq!(relay.state(), RelayState::FailedToStart);
    }

    #[tokio::test]
    async fn test_hung_log_command_is_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = test_config(dir.path());
        cfg.status_command = argv(&["echo", "activating"]);
        cfg.log_command = argv(&["sleep", "30"]);

        let mut relay = RelaySupervisor::new(cfg);
        let started = std::time::Instant::now();
        let err = relay.restart_and_wait(Duration::from_millis(100)).await.unwrap_err();
        assert!(started.elapsed() < LOG_TIMEOUT + Duration::from_secs(1));
        match err {
            StreamError::DependencyFailure { log_tail, .. } => {
                assert!(log_tail.starts_with("(log unavailable"), "{}", log_tail)
            }
            other => panic!("unexpected error {:?}", other),
        }
    }
}
