use crate::state::AppState;
use crate::stream::StreamKind;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// 后台看门狗：定期回收意外退出的流进程
///
/// # 任务流程：
/// - 每隔 `interval_ms` 检查一次两个控制器
/// - 正在 start/stop 的控制器本轮跳过（不会等锁）
/// - 进程已退出时控制器回到 Stopped，不会自动重启
pub async fn start_watchdog(state: Arc<AppState>, interval_ms: u64, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(Duration::from_millis(interval_ms.max(100)));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("Watchdog stopped");
                return;
            }
            _ = interval.tick() => {}
        }

        state.mjpg.reap_exited().await;
        state.rtsp.reap_exited().await;
    }
}

/// 开机自启：等待 `delay_sec` 后启动 autostart 为真的流
pub async fn autostart(state: Arc<AppState>, delay_sec: u64, cancel: CancellationToken) {
    tokio::select! {
        _ = cancel.cancelled() => return,
        _ = tokio::time::sleep(Duration::from_secs(delay_sec)) => {}
    }

    let stored = state.store.snapshot();
    for kind in StreamKind::ALL {
        let cfg = stored.get(kind);
        if !cfg.autostart {
            continue;
        }
        let running = match kind {
            StreamKind::Mjpg => state.mjpg.is_running().await,
            StreamKind::Rtsp => state.rtsp.is_running().await,
        };
        if running {
            info!("Autostart: {} stream already running, skipped", kind);
            continue;
        }
        info!("Autostart: starting {} stream", kind);
        let result = match kind {
            StreamKind::Mjpg => state.mjpg.start(cfg).await,
            StreamKind::Rtsp => state.rtsp.start(cfg).await,
        };
        match result {
            Ok(pid) => info!("Autostart: {} stream running (pid {})", kind, pid),
            Err(e) => error!("Autostart of {} stream failed: {}", kind, e),
        }
    }
}
