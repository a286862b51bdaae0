use crate::state::SharedState;
use axum::{extract::State, Json};
use serde::Serialize;
use std::path::Path;
use sysinfo::{CpuRefreshKind, RefreshKind, System};

const THERMAL_ZONE: &str = "/sys/class/thermal/thermal_zone0/temp";

/// 提供内嵌的控制页面
pub async fn index_handler() -> axum::response::Html<&'static str> {
    axum::response::Html(include_str!("../../static/index.html"))
}

#[derive(Debug, Clone, Serialize)]
pub struct SystemInfo {
    /// 所有核心的平均占用率
    pub cpu: f32,
    /// 内存占用百分比
    pub memory: f32,
    pub mem_total: u64,
    pub mem_avail: u64,
    pub load_avg: f64,
    /// 摄氏度，读取失败时为 0
    pub temperature: f32,
}

/// 采集系统信息
///
/// 内存和负载来自 sys-info，CPU 占用需要间隔两次采样，在阻塞线程里完成。
pub async fn system_info() -> SystemInfo {
    let cpu = tokio::task::spawn_blocking(cpu_usage).await.unwrap_or(0.0);
    // 转换为MB
    let (mem_total, mem_avail) = sys_info::mem_info()
        .map(|m| (m.total / 1024, m.avail / 1024))
        .unwrap_or((0, 0));
    let memory = if mem_total > 0 {
        (mem_total - mem_avail.min(mem_total)) as f32 * 100.0 / mem_total as f32
    } else {
        0.0
    };

    SystemInfo {
        cpu,
        memory,
        mem_total,
        mem_avail,
        load_avg: sys_info::loadavg().map(|l| l.one).unwrap_or(0.0),
        temperature: read_temperature(Path::new(THERMAL_ZONE)).await.unwrap_or(0.0),
    }
}

fn cpu_usage() -> f32 {
    let mut sys = System::new_with_specifics(
        RefreshKind::new().with_cpu(CpuRefreshKind::new().with_cpu_usage()),
    );
    std::thread::sleep(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL);
    sys.refresh_cpu_usage();

    let cpus = sys.cpus();
    if cpus.is_empty() {
        return 0.0;
    }
    cpus.iter().map(|c| c.cpu_usage()).sum::<f32>() / cpus.len() as f32
}

/// thermal zone 文件内容是毫摄氏度
async fn read_temperature(path: &Path) -> Option<f32> {
    let raw = tokio::fs::read_to_string(path).await.ok()?;
    raw.trim().parse::<f32>().ok().map(|milli| milli / 1000.0)
}

/// 存在的视频采集设备 `/dev/video0..9`
pub fn video_devices() -> Vec<String> {
    list_devices(Path::new("/dev"))
}

fn list_devices(root: &Path) -> Vec<String> {
    (0..10)
        .map(|i| root.join(format!("video{}", i)))
        .filter(|p| p.exists())
        .map(|p| p.to_string_lossy().into_owned())
        .collect()
}

/// 获取系统状态 API
pub async fn sys_status() -> Json<SystemInfo> {
    Json(system_info().await)
}

/// 配置 API，密码以掩码返回
pub async fn get_config(State(state): State<SharedState>) -> Json<serde_json::Value> {
    Json(serde_json::json!(state.store.snapshot().masked()))
}

/// 控制页面使用的总状态
pub async fn status(State(state): State<SharedState>) -> Json<serde_json::Value> {
    let mjpg = state.mjpg.status().await;
    let rtsp = state.rtsp.status().await;

    Json(serde_json::json!({
        "mjpg_running": mjpg.running,
        "mjpg_pid": mjpg.pid,
        "mjpg_state": state.mjpg.state(),
        "rtsp_running": rtsp.running,
        "rtsp_pid": rtsp.pid,
        "rtsp_state": state.rtsp.state(),
        "relay_state": state.rtsp.relay_state(),
        "devices": video_devices(),
        "system": system_info().await,
        "config": state.store.snapshot().masked(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_list_devices_in_order() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("video2"), b"").unwrap();
        std::fs::write(dir.path().join("video0"), b"").unwrap();
        std::fs::write(dir.path().join("video10"), b"").unwrap();

        let devices = list_devices(dir.path());
        assert_eq!(devices.len(), 2);
        assert!(devices[0].ends_with("video0"));
        assert!(devices[1].ends_with("video2"));
    }

    #[tokio::test]
    async fn test_read_temperature_millidegrees() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("temp");
        std::fs::write(&path, "48312\n").unwrap();
        let t = read_temperature(&path).await.unwrap();
        assert!((t - 48.312).abs() < 0.001);

        assert!(read_temperature(&dir.path().join("missing")).await.is_none());
    }
}
