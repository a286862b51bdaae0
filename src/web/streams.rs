use super::{request_host, ApiResponse};
use crate::engine::{MjpegController, StreamStatus};
use crate::error::{Result, StreamError, MASK};
use crate::state::SharedState;
use crate::stream::{SourceKind, StreamConfig, StreamKind};
use axum::{
    extract::{Path, State},
    http::HeaderMap,
    Form, Json,
};
use serde::Deserialize;
use std::path::{Path as FsPath, PathBuf};
use tracing::{error, info, warn};

/// 控制页面提交的表单
///
/// 复选框勾选时浏览器发送 `on`，未勾选时字段缺失。
#[derive(Debug, Default, Deserialize)]
pub struct StreamForm {
    pub source_type: Option<String>,
    pub device: Option<String>,
    /// 视频库中的文件路径或文件名
    pub video_file: Option<String>,
    pub resolution: Option<String>,
    pub framerate: Option<String>,
    pub quality: Option<String>,
    pub bitrate: Option<String>,
    pub port: Option<String>,
    pub autostart: Option<String>,
    pub auth_enabled: Option<String>,
    pub auth_username: Option<String>,
    pub auth_password: Option<String>,
}

fn field(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

fn checked(value: &Option<String>) -> bool {
    matches!(field(value), Some("on" | "true" | "1"))
}

fn number<T: std::str::FromStr>(value: &Option<String>, name: &str, default: T) -> Result<T> {
    match field(value) {
        None => Ok(default),
        Some(raw) => raw
            .parse()
            .map_err(|_| StreamError::validation(format!("{} must be an integer, got '{}'", name, raw))),
    }
}

impl StreamForm {
    /// 合成完整的流配置
    ///
    /// 缺失字段取该类流的默认值；视频文件缺失时沿用已保存的路径；
    /// 密码为空或为掩码时沿用已保存的密码。
    pub fn to_config(&self, kind: StreamKind, stored: &StreamConfig, video_dir: &FsPath) -> Result<StreamConfig> {
        let defaults = StreamConfig::default_for(kind);

        let source_type = match field(&self.source_type) {
            Some(raw) => raw.parse()?,
            None => SourceKind::Device,
        };
        let video_path = match field(&self.video_file) {
            Some(name) => Some(resolve_video(video_dir, name)),
            None => stored.video_path.clone(),
        };
        let auth_password = match field(&self.auth_password) {
            Some(p) if p != MASK => p.to_string(),
            _ => stored.auth_password.clone(),
        };

        Ok(StreamConfig {
            source_type,
            device: field(&self.device).map(PathBuf::from).unwrap_or(defaults.device),
            video_path,
            resolution: match field(&self.resolution) {
                Some(raw) => raw.parse()?,
                None => defaults.resolution,
            },
            framerate: number(&self.framerate, "framerate", defaults.framerate)?,
            quality: number(&self.quality, "quality", defaults.quality)?,
            bitrate: field(&self.bitrate).map(str::to_string).unwrap_or(defaults.bitrate),
            port: number(&self.port, "port", defaults.port)?,
            autostart: checked(&self.autostart),
            auth_enabled: checked(&self.auth_enabled),
            auth_username: field(&self.auth_username)
                .map(str::to_string)
                .unwrap_or(defaults.auth_username),
            auth_password,
        })
    }
}

/// 相对名称按视频库目录解析
fn resolve_video(video_dir: &FsPath, name: &str) -> PathBuf {
    let path = PathBuf::from(name);
    if path.is_absolute() {
        path
    } else {
        video_dir.join(path)
    }
}

fn parse_kind(raw: &str) -> std::result::Result<StreamKind, ApiResponse> {
    raw.parse::<StreamKind>().map_err(ApiResponse::from)
}

/// 启动流 API
///
/// 表单转成配置后先做校验和源检查，通过后文件源的路径写入配置存储，再交给控制器启动。
/// 已在运行的同类流会被替换。
pub async fn handle_start(
    State(state): State<SharedState>,
    Path(kind): Path<String>,
    headers: HeaderMap,
    Form(form): Form<StreamForm>,
) -> ApiResponse {
    let kind = match parse_kind(&kind) {
        Ok(k) => k,
        Err(resp) => return resp,
    };

    let stored = state.store.stream(kind);
    let mut cfg = match form.to_config(kind, &stored, &state.config.server.video_dir) {
        Ok(cfg) => cfg,
        Err(e) => return e.into(),
    };
    cfg.autostart = stored.autostart;

    // 校验不过或文件不存在时不改动已保存的路径
    if let Err(e) = cfg.validate(kind).and_then(|()| cfg.ensure_source_exists()) {
        return e.into();
    }
    if cfg.source_type == SourceKind::File && cfg.video_path != stored.video_path {
        let video_path = cfg.video_path.clone();
        if let Err(e) = state.store.update(|doc| doc.get_mut(kind).video_path = video_path) {
            error!("Failed to persist video path for {}: {:#}", kind, e);
            return ApiResponse::fail(format!("failed to save config: {}", e));
        }
    }

    info!("API: start {} stream", kind);
    let result = match kind {
        StreamKind::Mjpg => state.mjpg.start(&cfg).await,
        StreamKind::Rtsp => state.rtsp.start(&cfg).await,
    };

    match result {
        Ok(pid) => {
            let host = request_host(&headers);
            let url = match kind {
                StreamKind::Mjpg => MjpegController::stream_url(&host, &cfg),
                StreamKind::Rtsp => state.rtsp.stream_url(&host, &cfg),
            };
            ApiResponse {
                pid: Some(pid),
                url: Some(url),
                ..ApiResponse::ok()
            }
        }
        Err(e) => e.into(),
    }
}

/// 停止流 API，总是成功，清理过程中的问题放在 warnings 中
pub async fn handle_stop(State(state): State<SharedState>, Path(kind): Path<String>) -> ApiResponse {
    let kind = match parse_kind(&kind) {
        Ok(k) => k,
        Err(resp) => return resp,
    };

    info!("API: stop {} stream", kind);
    let report = match kind {
        StreamKind::Mjpg => state.mjpg.stop().await,
        StreamKind::Rtsp => state.rtsp.stop().await,
    };
    if !report.orphans.is_empty() {
        warn!("{} stop also terminated untracked pids {:?}", kind, report.orphans);
    }
    ApiResponse {
        warnings: report.warnings,
        ..ApiResponse::ok()
    }
}

/// 保存配置但不启动
pub async fn handle_save(
    State(state): State<SharedState>,
    Path(kind): Path<String>,
    Form(form): Form<StreamForm>,
) -> ApiResponse {
    let kind = match parse_kind(&kind) {
        Ok(k) => k,
        Err(resp) => return resp,
    };

    let stored = state.store.stream(kind);
    let cfg = match form.to_config(kind, &stored, &state.config.server.video_dir) {
        Ok(cfg) => cfg,
        Err(e) => return e.into(),
    };

    match state.store.update(|doc| *doc.get_mut(kind) = cfg) {
        Ok(()) => {
            info!("API: saved {} stream config", kind);
            ApiResponse::ok()
        }
        Err(e) => {
            error!("Failed to save {} config: {:#}", kind, e);
            ApiResponse::fail(format!("failed to save config: {}", e))
        }
    }
}

/// 流状态 API：`{running, pid}`
pub async fn handle_status(
    State(state): State<SharedState>,
    Path(kind): Path<String>,
) -> std::result::Result<Json<StreamStatus>, ApiResponse> {
    let status = match parse_kind(&kind)? {
        StreamKind::Mjpg => state.mjpg.status().await,
        StreamKind::Rtsp => state.rtsp.status().await,
    };
    Ok(Json(status))
}


#[cfg(all(test, unix))]
mod handler_tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::engine::testutil::{fake_tool, LONG_RUNNING};
    use crate::state::AppState;
    use crate::store::ConfigStore;
    use axum::http::HeaderValue;
    use std::sync::Arc;

    fn app(dir: &FsPath, streamer: &str) -> SharedState {
        let mut config = AppConfig::default();
        config.server.video_dir = dir.join("videos");
        config.tools.mjpg_streamer = fake_tool(dir, streamer, LONG_RUNNING);
        config.tools.ffmpeg = "/nonexistent/ffmpeg".into();
        config.mjpeg.staging_dir = dir.join("frames");
        config.mjpeg.startup_grace_ms = 150;
        config.mjpeg.stop_grace_ms = 1000;
        std::fs::create_dir_all(&config.server.video_dir).unwrap();
        let store = ConfigStore::open(dir.join("stream_config.json")).unwrap();
        Arc::new(AppState::new(config, store))
    }

    #[tokio::test]
    async fn test_start_persists_video_path_and_stop_reports() {
        let dir = tempfile::tempdir().unwrap();
        let state = app(dir.path(), "fake_mjpg_api");
        std::fs::write(dir.path().join("videos/clip.mp4"), b"").unwrap();

        let mut headers = HeaderMap::new();
        headers.insert("host", HeaderValue::from_static("pi.local:5000"));
        let resp = handle_start(
            State(state.clone()),
            Path("mjpg".to_string()),
            headers,
            Form(StreamForm {
                source_type: Some("video".into()),
                video_file: Some("clip.mp4".into()),
                ..StreamForm::default()
            }),
        )
        .await;
        assert!(resp.success, "{:?}", resp);
        assert_eq!(resp.url.as_deref(), Some("http://pi.local:8080"));
        assert_eq!(
            state.store.stream(StreamKind::Mjpg).video_path,
            Some(dir.path().join("videos/clip.mp4"))
        );

        let Json(status) = handle_status(State(state.clone()), Path("mjpeg".to_string()))
            .await
            .unwrap();
        assert!(status.running);
        assert_eq!(status.pid, resp.pid);

        let resp = handle_stop(State(state.clone()), Path("mjpg".to_string())).await;
        assert!(resp.success);
        assert!(resp.warnings.is_empty(), "{:?}", resp.warnings);
    }

    #[tokio::test]
    async fn test_start_missing_device_is_precondition() {
        let dir = tempfile::tempdir().unwrap();
        let state = app(dir.path(), "fake_mjpg_nodev");

        let resp = handle_start(
            State(state.clone()),
            Path("mjpg".to_string()),
            HeaderMap::new(),
            Form(StreamForm {
                device: Some("/dev/video-absent".into()),
                ..StreamForm::default()
            }),
        )
        .await;
        assert!(!resp.success);
        assert_eq!(resp.kind, Some("precondition"));
        assert_eq!(resp.error.as_deref(), Some("device not found: /dev/video-absent"));
    }

    #[tokio::test]
    async fn test_start_with_missing_video_keeps_stored_path() {
        let dir = tempfile::tempdir().unwrap();
        let state = app(dir.path(), "fake_mjpg_keep");
        let kept = dir.path().join("videos/kept.mp4");
        std::fs::write(&kept, b"").unwrap();
        state
            .store
            .update(|doc| doc.mjpg.video_path = Some(kept.clone()))
            .unwrap();

        let resp = handle_start(
            State(state.clone()),
            Path("mjpg".to_string()),
            HeaderMap::new(),
            Form(StreamForm {
                source_type: Some("file".into()),
                video_file: Some("gone.mp4".into()),
                ..StreamForm::default()
            }),
        )
        .await;
        assert!(!resp.success);
        assert_eq!(resp.kind, Some("precondition"));
        assert_eq!(state.store.stream(StreamKind::Mjpg).video_path, Some(kept));
    }

    #[tokio::test]
    async fn test_save_and_unknown_kind() {
        let dir = tempfile::tempdir().unwrap();
        let state = app(dir.path(), "fake_mjpg_save");

        let resp = handle_save(
            State(state.clone()),
            Path("rtsp".to_string()),
            Form(StreamForm {
                bitrate: Some("2M".into()),
                autostart: Some("on".into()),
                ..StreamForm::default()
            }),
        )
        .await;
        assert!(resp.success);
        let saved = state.store.stream(StreamKind::Rtsp);
        assert_eq!(saved.bitrate, "2M");
        assert!(saved.autostart);

        let resp = handle_stop(State(state), Path("hls".to_string())).await;
        assert_eq!(resp.kind, Some("validation"));
    }
}
