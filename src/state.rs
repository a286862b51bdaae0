use crate::config::AppConfig;
use crate::engine::{MjpegController, RtspController};
use crate::store::ConfigStore;
use std::sync::Arc;

/// 全局应用上下文
///
/// 每种流只有一个控制器，HTTP 处理函数和后台任务共享同一个实例。
pub struct AppState {
    pub config: AppConfig,
    /// 持久化的流配置 (stream_config.json)
    pub store: ConfigStore,
    pub mjpg: MjpegController,
    pub rtsp: RtspController,
}

impl AppState {
    pub fn new(config: AppConfig, store: ConfigStore) -> Self {
        let mjpg = MjpegController::new(config.tools.clone(), config.mjpeg.clone());
        let rtsp = RtspController::new(
            config.tools.clone(),
            config.rtsp.clone(),
            config.relay.clone(),
        );
        Self {
            config,
            store,
            mjpg,
            rtsp,
        }
    }
}

pub type SharedState = Arc<AppState>;
