use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub tools: ToolsConfig,
    pub mjpeg: MjpegConfig,
    pub rtsp: RtspConfig,
    pub relay: RelayConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub listen: String,
    /// 流配置 JSON 文件 (Config Store)
    pub store_path: PathBuf,
    /// 视频库目录
    pub video_dir: PathBuf,
    pub watchdog_interval_ms: u64,
    /// 开机自启前的等待时间
    pub autostart_delay_sec: u64,
    /// 上传视频的大小上限
    pub max_upload_mb: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:5000".to_string(),
            store_path: PathBuf::from("stream_config.json"),
            video_dir: PathBuf::from("videos"),
            watchdog_interval_ms: 2000,
            autostart_delay_sec: 5,
            max_upload_mb: 2048,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ToolsConfig {
    pub mjpg_streamer: PathBuf,
    pub ffmpeg: PathBuf,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            mjpg_streamer: PathBuf::from("/usr/local/bin/mjpg_streamer"),
            ffmpeg: PathBuf::from("ffmpeg"),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct MjpegConfig {
    /// 文件源的帧暂存目录
    /// 建议配置在 tmpfs 上以保护闪存寿命
    pub staging_dir: PathBuf,
    pub startup_grace_ms: u64,
    pub stop_grace_ms: u64,
}

impl Default for MjpegConfig {
    fn default() -> Self {
        Self {
            staging_dir: PathBuf::from("/tmp/mjpg_frames"),
            startup_grace_ms: 1000,
            stop_grace_ms: 3000,
        }
    }
}

impl MjpegConfig {
    pub fn startup_grace(&self) -> Duration {
        Duration::from_millis(self.startup_grace_ms)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RtspConfig {
    pub startup_grace_ms: u64,
    pub stop_grace_ms: u64,
    /// 中继推流地址的主机部分
    pub ingest_host: String,
    /// 推流路径，即 `rtsp://host:port/<path>`
    pub path: String,
}

impl Default for RtspConfig {
    fn default() -> Self {
        Self {
            startup_grace_ms: 2000,
            stop_grace_ms: 3000,
            ingest_host: "localhost".to_string(),
            path: "video".to_string(),
        }
    }
}

impl RtspConfig {
    pub fn startup_grace(&self) -> Duration {
        Duration::from_millis(self.startup_grace_ms)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }
}

/// RTSP 中继 (MediaMTX) 的管理方式
///
/// 所有命令都是参数向量，不经过 shell。
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RelayConfig {
    /// 中继正在使用的配置文件
    pub config_path: PathBuf,
    /// 临时文件所在目录；为空时直接 rename 用 config_path 同目录，
    /// 使用安装命令时用系统临时目录
    pub staging_dir: Option<PathBuf>,
    /// 安装命令前缀，如 `[sudo, cp]`，会追加 `<tmp> <live>`；为空时直接 rename
    pub install_command: Vec<String>,
    pub restart_command: Vec<String>,
    pub status_command: Vec<String>,
    pub stop_command: Vec<String>,
    pub log_command: Vec<String>,
    pub ready_timeout_ms: u64,
    pub poll_interval_ms: u64,
    pub rtp_port: u16,
    pub rtcp_port: u16,
    pub hls_port: u16,
}

impl Default for RelayConfig {
    fn default() -> Self {
        let argv = |parts: &[&str]| parts.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        Self {
            config_path: PathBuf::from("/etc/mediamtx/mediamtx.yml"),
            staging_dir: None,
            install_command: argv(&["sudo", "cp"]),
            restart_command: argv(&["sudo", "systemctl", "restart", "mediamtx"]),
            status_command: argv(&["systemctl", "is-active", "mediamtx"]),
            stop_command: argv(&["sudo", "systemctl", "stop", "mediamtx"]),
            log_command: argv(&["sudo", "journalctl", "-u", "mediamtx", "-n", "10", "--no-pager"]),
            ready_timeout_ms: 5000,
            poll_interval_ms: 250,
            rtp_port: 8000,
            rtcp_port: 8001,
            hls_port: 8888,
        }
    }
}

impl RelayConfig {
    pub fn ready_timeout(&self) -> Duration {
        Duration::from_millis(self.ready_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(10))
    }
}

impl AppConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config = serde_yaml::from_str(&content)?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let cfg: AppConfig = serde_yaml::from_str(
            r#"
server:
  listen: 127.0.0.1:9000
tools:
  ffmpeg: /opt/ffmpeg/bin/ffmpeg
relay:
  install_command: []
  ready_timeout_ms: 1500
"#,
        )
        .unwrap();

        assert_eq!(cfg.server.listen, "127.0.0.1:9000");
        assert_eq!(cfg.server.autostart_delay_sec, 5);
        assert_eq!(cfg.tools.ffmpeg, PathBuf::from("/opt/ffmpeg/bin/ffmpeg"));
        assert_eq!(cfg.tools.mjpg_streamer, PathBuf::from("/usr/local/bin/mjpg_streamer"));
        assert!(cfg.relay.install_command.is_empty());
        assert_eq!(cfg.relay.ready_timeout(), Duration::from_millis(1500));
        assert_eq!(cfg.relay.restart_command[0], "sudo");
        assert_eq!(cfg.mjpeg.startup_grace(), Duration::from_secs(1));
        assert_eq!(cfg.rtsp.path, "video");
    }
}
