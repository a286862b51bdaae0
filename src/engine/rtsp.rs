use super::{launch, terminate_slot, StopReport, StreamState, StreamStatus};
use crate::command;
use crate::config::{RelayConfig, RtspConfig, ToolsConfig};
use crate::discovery::{self, ArgMarker, ProcessSignature};
use crate::error::Result;
use crate::process::ProcessHandle;
use crate::relay::{RelayState, RelaySupervisor};
use crate::stream::{StreamConfig, StreamKind};
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tracing::{error, info, warn};

struct RtspInner {
    encoder: Option<ProcessHandle>,
    relay: RelaySupervisor,
    /// 锁外发生的终止警告（看门狗回收、启动失败时的中继停止），由下一次 stop 上报
    pending: Vec<String>,
}

/// RTSP 控制器：ffmpeg 编码后推送到本地中继
pub struct RtspController {
    tools: ToolsConfig,
    settings: RtspConfig,
    relay_timeout: Duration,
    inner: Mutex<RtspInner>,
    /// 状态在锁外发布，查询不必等待正在进行的 start/stop
    state: watch::Sender<StreamState>,
    relay_state: watch::Receiver<RelayState>,
    signature: ProcessSignature,
}

impl RtspController {
    pub fn new(tools: ToolsConfig, settings: RtspConfig, relay: RelayConfig) -> Self {
        let signature = ProcessSignature::new(
            &tools.ffmpeg,
            ArgMarker::Endpoint {
                prefix: "rtsp://".to_string(),
                suffix: format!("/{}", settings.path.trim_start_matches('/')),
            },
        );
        let relay_timeout = relay.ready_timeout();
        let relay = RelaySupervisor::new(relay);
        let relay_state = relay.watch();
        Self {
            tools,
            settings,
            relay_timeout,
            inner: Mutex::new(RtspInner {
                encoder: None,
                relay,
                pending: Vec::new(),
            }),
            state: watch::channel(StreamState::Stopped).0,
            relay_state,
            signature,
        }
    }

    fn set_state(&self, next: StreamState) {
        self.state.send_replace(next);
    }

    /// 启动 RTSP 流
    ///
    /// 先校验配置和源文件，再配置并重启中继，中继就绪后才启动编码器。
    /// 源不存在时不会触碰中继。
    pub async fn start(&self, cfg: &StreamConfig) -> Result<u32> {
        cfg.validate(StreamKind::Rtsp)?;
        cfg.ensure_source_exists()?;

        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;
        let replaced = self.stop_encoder(inner).await;
        if !replaced.orphans.is_empty() || !replaced.warnings.is_empty() {
            info!("[RTSP] Cleared previous encoder before start: {:?}", replaced);
        }

        info!(
            "[RTSP] Starting: source={:?}, auth={}",
            cfg.source_type, cfg.auth_enabled
        );
        self.set_state(StreamState::Starting);

        let result = self.launch_pipeline(inner, cfg).await;
        match result {
            Ok(pid) => {
                self.set_state(StreamState::Running);
                info!("[RTSP] Running (pid {})", pid);
                Ok(pid)
            }
            Err(e) => {
                let e = e.redact(&cfg.secrets());
                error!("[RTSP] Start failed: {}", e);
                if inner.relay.state() != RelayState::Inactive {
                    if let Some(w) = inner.relay.stop().await {
                        warn!("[RTSP] Relay stop after failed start: {}", w);
                        inner.pending.push(w.to_string());
                    }
                }
                self.set_state(StreamState::Stopped);
                Err(e)
            }
        }
    }

    async fn launch_pipeline(&self, inner: &mut RtspInner, cfg: &StreamConfig) -> Result<u32> {
        inner.relay.apply_config(cfg).await?;
        inner.relay.restart_and_wait(self.relay_timeout).await?;

        let cmd = command::rtsp_encoder(
            &self.tools.ffmpeg,
            cfg,
            &self.settings.ingest_host,
            &self.settings.path,
        );
        launch(&mut inner.encoder, &cmd, self.settings.startup_grace()).await
    }

    /// 停止编码器并单独命令中继停止，两者都是尽力而为
    pub async fn stop(&self) -> StopReport {
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;

        let mut report = self.stop_encoder(inner).await;
        if let Some(w) = inner.relay.stop().await {
            warn!("[RTSP] Relay stop: {}", w);
            report.warnings.push(w.to_string());
        }
        info!("[RTSP] Stopped ({} warning(s))", report.warnings.len());
        report
    }

    async fn stop_encoder(&self, inner: &mut RtspInner) -> StopReport {
        let grace = self.settings.stop_grace();
        let mut report = StopReport::default();
        report.warnings.append(&mut inner.pending);

        terminate_slot(&mut inner.encoder, grace, &mut report).await;
        let orphans = StopReport {
            warnings: Vec::new(),
            orphans: discovery::terminate_matching(&self.signature, grace).await,
        };
        report.merge(orphans);

        self.set_state(StreamState::Stopped);
        report
    }

    /// 进程表中是否存在推流 ffmpeg，与控制器自身句柄无关
    pub async fn is_running(&self) -> bool {
        !discovery::find(&self.signature).await.is_empty()
    }

    pub async fn status(&self) -> StreamStatus {
        let pids = discovery::find(&self.signature).await;
        StreamStatus {
            running: !pids.is_empty(),
            pid: pids.first().copied(),
        }
    }

    pub fn state(&self) -> StreamState {
        *self.state.borrow()
    }

    pub fn relay_state(&self) -> RelayState {
        *self.relay_state.borrow()
    }

    /// 检测编码器意外退出；中继保持运行，由下一次 stop/start 处理
    pub async fn reap_exited(&self) {
        let Ok(mut guard) = self.inner.try_lock() else {
            return;
        };
        let inner = &mut *guard;
        let Some(encoder) = inner.encoder.as_mut() else {
            return;
        };

        if encoder.is_alive() {
            if self.state() == StreamState::Starting {
                self.set_state(StreamState::Running);
            }
            return;
        }

        warn!(
            "[RTSP] Encoder (pid {}) exited unexpectedly after {}s",
            encoder.pid(),
            encoder.uptime().as_secs()
        );
        let mut report = StopReport::default();
        terminate_slot(&mut inner.encoder, self.settings.stop_grace(), &mut report).await;
        inner.pending.extend(report.warnings);
        self.set_state(StreamState::Stopped);
    }

    pub fn stream_url(&self, host: &str, cfg: &StreamConfig) -> String {
        format!(
            "rtsp://{}:{}/{}",
            host,
            cfg.port,
            self.settings.path.trim_start_matches('/')
        )
    }
}
