use super::{launch, terminate_slot, StopReport, StreamState, StreamStatus};
use crate::command;
use crate::config::{MjpegConfig, ToolsConfig};
use crate::discovery::{self, ArgMarker, ProcessSignature};
use crate::error::Result;
use crate::janitor;
use crate::process::ProcessHandle;
use crate::stream::{SourceKind, StreamConfig, StreamKind};
use tokio::sync::{watch, Mutex};
use tracing::{error, info, warn};

struct MjpegInner {
    /// mjpg_streamer，流的主句柄
    streamer: Option<ProcessHandle>,
    /// 文件源时的 ffmpeg 解帧进程
    producer: Option<ProcessHandle>,
    /// 看门狗回收时产生的终止警告，由下一次 stop 上报
    pending: Vec<String>,
}

/// MJPEG-over-HTTP 控制器
///
/// 所有 start/stop 在同一把锁内串行执行。
pub struct MjpegController {
    tools: ToolsConfig,
    settings: MjpegConfig,
    inner: Mutex<MjpegInner>,
    state: watch::Sender<StreamState>,
    streamer_sig: ProcessSignature,
    producer_sig: ProcessSignature,
}

impl MjpegController {
    pub fn new(tools: ToolsConfig, settings: MjpegConfig) -> Self {
        let streamer_sig = ProcessSignature::new(
            &tools.mjpg_streamer,
            ArgMarker::Contains("output_http.so".to_string()),
        );
        let producer_sig = ProcessSignature::new(
            &tools.ffmpeg,
            ArgMarker::Contains(settings.staging_dir.to_string_lossy().into_owned()),
        );
        Self {
            tools,
            settings,
            inner: Mutex::new(MjpegInner {
                streamer: None,
                producer: None,
                pending: Vec::new(),
            }),
            state: watch::channel(StreamState::Stopped).0,
            streamer_sig,
            producer_sig,
        }
    }

    fn set_state(&self, next: StreamState) {
        self.state.send_replace(next);
    }

    /// 启动 MJPEG 流，已有的流会先被完整停止（替换而不是叠加）
    ///
    /// # 错误处理
    /// - 配置非法：Validation
    /// - 设备或视频不存在：Precondition，此时不会创建任何进程
    /// - mjpg_streamer 启动失败：Spawn / StartupTimeout，控制器回到 Stopped
    pub async fn start(&self, cfg: &StreamConfig) -> Result<u32> {
        cfg.validate(StreamKind::Mjpg)?;
        cfg.ensure_source_exists()?;

        let mut inner = self.inner.lock().await;
        let replaced = self.shutdown(&mut inner).await;
        if !replaced.orphans.is_empty() || !replaced.warnings.is_empty() {
            info!("[MJPEG] Cleared previous instance before start: {:?}", replaced);
        }

        info!(
            "[MJPEG] Starting: source={:?}, auth={}",
            cfg.source_type, cfg.auth_enabled
        );
        self.set_state(StreamState::Starting);

        match self.launch_pipeline(&mut inner, cfg).await {
            Ok(pid) => {
                self.set_state(StreamState::Running);
                info!("[MJPEG] Running (pid {})", pid);
                Ok(pid)
            }
            Err(e) => {
                let e = e.redact(&cfg.secrets());
                error!("[MJPEG] Start failed: {}", e);
                let mut report = StopReport::default();
                terminate_slot(&mut inner.producer, self.settings.stop_grace(), &mut report).await;
                janitor::purge(&self.settings.staging_dir).await;
                self.set_state(StreamState::Stopped);
                Err(e)
            }
        }
    }

    async fn launch_pipeline(&self, inner: &mut MjpegInner, cfg: &StreamConfig) -> Result<u32> {
        let staging = &self.settings.staging_dir;

        if cfg.source_type == SourceKind::File {
            if let Some(video) = cfg.video_path.as_deref() {
                janitor::reset(staging).await;
                let cmd = command::frame_producer(&self.tools.ffmpeg, cfg, video, staging);
                match ProcessHandle::spawn(&cmd) {
                    Ok(handle) => inner.producer = Some(handle),
                    Err(e) => warn!("[MJPEG] Frame producer did not start: {}", e),
                }
            }
        }

        let cmd = command::mjpg_streamer(&self.tools.mjpg_streamer, cfg, staging);
        let pid = launch(&mut inner.streamer, &cmd, self.settings.startup_grace()).await?;

        if let Some(producer) = inner.producer.as_mut() {
            if !producer.is_alive() {
                warn!(
                    "[MJPEG] Frame producer (pid {}) exited early; the stream will stay blank",
                    producer.pid()
                );
                inner.producer = None;
            }
        }
        Ok(pid)
    }

    /// 停止流，幂等且从不返回错误
    pub async fn stop(&self) -> StopReport {
        let mut inner = self.inner.lock().await;
        let report = self.shutdown(&mut inner).await;
        info!("[MJPEG] Stopped ({} warning(s))", report.warnings.len());
        report
    }

    async fn shutdown(&self, inner: &mut MjpegInner) -> StopReport {
        let grace = self.settings.stop_grace();
        let mut report = StopReport::default();
        report.warnings.append(&mut inner.pending);

        terminate_slot(&mut inner.streamer, grace, &mut report).await;
        terminate_slot(&mut inner.producer, grace, &mut report).await;

        // 上次崩溃遗留的进程
        report
            .orphans
            .extend(discovery::terminate_matching(&self.streamer_sig, grace).await);
        report
            .orphans
            .extend(discovery::terminate_matching(&self.producer_sig, grace).await);

        janitor::purge(&self.settings.staging_dir).await;
        self.set_state(StreamState::Stopped);
        report
    }

    /// 进程表中是否存在 mjpg_streamer，与控制器自身句柄无关
    pub async fn is_running(&self) -> bool {
        !discovery::find(&self.streamer_sig).await.is_empty()
    }

    pub async fn status(&self) -> StreamStatus {
        let pids = discovery::find(&self.streamer_sig).await;
        StreamStatus {
            running: !pids.is_empty(),
            pid: pids.first().copied(),
        }
    }

    pub fn state(&self) -> StreamState {
        *self.state.borrow()
    }

    /// 检测意外退出；有操作持锁时跳过本轮
    pub async fn reap_exited(&self) {
        let Ok(mut guard) = self.inner.try_lock() else {
            return;
        };
        let inner = &mut *guard;
        let Some(streamer) = inner.streamer.as_mut() else {
            return;
        };

        if streamer.is_alive() {
            if self.state() == StreamState::Starting {
                self.set_state(StreamState::Running);
            }
            return;
        }

        warn!(
            "[MJPEG] mjpg_streamer (pid {}) exited unexpectedly after {}s",
            streamer.pid(),
            streamer.uptime().as_secs()
        );
        let grace = self.settings.stop_grace();
        let mut report = StopReport::default();
        terminate_slot(&mut inner.streamer, grace, &mut report).await;
        terminate_slot(&mut inner.producer, grace, &mut report).await;
        inner.pending.extend(report.warnings);
        janitor::purge(&self.settings.staging_dir).await;
        self.set_state(StreamState::Stopped);
    }

    pub fn stream_url(host: &str, cfg: &StreamConfig) -> String {
        format!("http://{}:{}", host, cfg.port)
    }
}
