use crate::error::{Result, StreamError, MASK};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// 两种输出管线
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    Mjpg,
    Rtsp,
}

impl StreamKind {
    pub const ALL: [StreamKind; 2] = [StreamKind::Mjpg, StreamKind::Rtsp];
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            StreamKind::Mjpg => "MJPEG",
            StreamKind::Rtsp => "RTSP",
        })
    }
}

impl FromStr for StreamKind {
    type Err = StreamError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "mjpg" | "mjpeg" => Ok(StreamKind::Mjpg),
            "rtsp" => Ok(StreamKind::Rtsp),
            other => Err(StreamError::validation(format!("unknown stream kind '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    #[default]
    Device,
    #[serde(alias = "video")]
    File,
}

impl FromStr for SourceKind {
    type Err = StreamError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "device" => Ok(SourceKind::Device),
            "file" | "video" => Ok(SourceKind::File),
            other => Err(StreamError::validation(format!("unknown source type '{}'", other))),
        }
    }
}

/// `WIDTHxHEIGHT`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl FromStr for Resolution {
    type Err = StreamError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || StreamError::validation(format!("invalid resolution '{}', expected WIDTHxHEIGHT", s));
        let (w, h) = s.trim().split_once(['x', 'X']).ok_or_else(invalid)?;
        let width: u32 = w.parse().map_err(|_| invalid())?;
        let height: u32 = h.parse().map_err(|_| invalid())?;
        if width == 0 || height == 0 {
            return Err(invalid());
        }
        Ok(Self { width, height })
    }
}

impl TryFrom<String> for Resolution {
    type Error = StreamError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<Resolution> for String {
    fn from(value: Resolution) -> Self {
        value.to_string()
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// 单个流的参数，同时也是配置存储中每个分区的结构
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    pub source_type: SourceKind,
    pub device: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub video_path: Option<PathBuf>,
    pub resolution: Resolution,
    pub framerate: u32,
    /// 0-100，仅 MJPEG 使用
    pub quality: i32,
    /// 如 `1000k`，仅 RTSP 使用
    pub bitrate: String,
    pub port: u16,
    pub autostart: bool,
    pub auth_enabled: bool,
    pub auth_username: String,
    pub auth_password: String,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self::mjpg_default()
    }
}

impl StreamConfig {
    pub fn mjpg_default() -> Self {
        Self {
            source_type: SourceKind::Device,
            device: PathBuf::from("/dev/video0"),
            video_path: None,
            resolution: Resolution { width: 640, height: 480 },
            framerate: 15,
            quality: 85,
            bitrate: "1000k".to_string(),
            port: 8080,
            autostart: true,
            auth_enabled: true,
            auth_username: "stream".to_string(),
            auth_password: "stream".to_string(),
        }
    }

    pub fn rtsp_default() -> Self {
        Self {
            framerate: 25,
            port: 8554,
            autostart: false,
            ..Self::mjpg_default()
        }
    }

    pub fn default_for(kind: StreamKind) -> Self {
        match kind {
            StreamKind::Mjpg => Self::mjpg_default(),
            StreamKind::Rtsp => Self::rtsp_default(),
        }
    }

    /// 按来源类型选出的有效路径
    pub fn source_path(&self) -> Option<&Path> {
        match self.source_type {
            SourceKind::Device => Some(self.device.as_path()),
            SourceKind::File => self.video_path.as_deref(),
        }
    }

    /// Credentials that should be passed to the tool, if auth is on.
    pub fn credentials(&self) -> Option<(&str, &str)> {
        self.auth_enabled
            .then_some((self.auth_username.as_str(), self.auth_password.as_str()))
    }

    /// Texts to scrub from tool output: the password as typed and in the
    /// percent-encoded form used inside the ingest URL. Empty when auth is off.
    pub fn secrets(&self) -> Vec<String> {
        let Some((_, pass)) = self.credentials().filter(|(_, p)| !p.is_empty()) else {
            return Vec::new();
        };
        let mut secrets = vec![pass.to_string()];
        if let Ok(mut url) = url::Url::parse("rtsp://localhost/") {
            if url.set_password(Some(pass)).is_ok() {
                if let Some(encoded) = url.password().filter(|e| *e != pass) {
                    secrets.push(encoded.to_string());
                }
            }
        }
        secrets
    }

    /// 校验字段，失败时不会尝试启动任何进程
    pub fn validate(&self, kind: StreamKind) -> Result<()> {
        if self.framerate == 0 {
            return Err(StreamError::validation("framerate must be a positive integer"));
        }
        if self.port < 1024 {
            return Err(StreamError::validation(format!(
                "port {} is outside the user range 1024-65535",
                self.port
            )));
        }

        let path = match self.source_path() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => {
                return Err(StreamError::validation(match self.source_type {
                    SourceKind::Device => "no video device selected",
                    SourceKind::File => "no video file selected",
                }))
            }
        };

        match kind {
            // mjpg_streamer splits plugin arguments on whitespace
            StreamKind::Mjpg
                if self.source_type == SourceKind::Device
                    && path.to_string_lossy().chars().any(char::is_whitespace) =>
            {
                return Err(StreamError::validation(
                    "device path must not contain whitespace for the MJPEG streamer",
                ));
            }
            StreamKind::Mjpg => {}
            StreamKind::Rtsp => validate_bitrate(&self.bitrate)?,
        }

        if self.auth_enabled {
            if self.auth_username.is_empty() || self.auth_password.is_empty() {
                return Err(StreamError::validation(
                    "authentication is enabled but username or password is empty",
                ));
            }
            if self.auth_username.contains(':') {
                return Err(StreamError::validation("username must not contain ':'"));
            }
            if kind == StreamKind::Mjpg
                && (self.auth_username.chars().any(char::is_whitespace)
                    || self.auth_password.chars().any(char::is_whitespace))
            {
                return Err(StreamError::validation(
                    "credentials must not contain whitespace for the MJPEG streamer",
                ));
            }
        }

        Ok(())
    }

    /// 检查设备或视频文件是否存在
    pub fn ensure_source_exists(&self) -> Result<()> {
        let Some(path) = self.source_path() else {
            return Err(StreamError::validation("no video file selected"));
        };
        if path.exists() {
            return Ok(());
        }
        Err(StreamError::precondition(match self.source_type {
            SourceKind::Device => format!("device not found: {}", path.display()),
            SourceKind::File => format!("video not found: {}", path.display()),
        }))
    }

    /// Copy that is safe to hand to the browser.
    pub fn masked(&self) -> Self {
        Self {
            auth_password: MASK.to_string(),
            ..self.clone()
        }
    }
}

fn validate_bitrate(bitrate: &str) -> Result<()> {
    let digits = bitrate.trim_end_matches(['k', 'K', 'm', 'M']);
    let suffix_len = bitrate.len() - digits.len();
    if digits.is_empty()
        || suffix_len > 1
        || !digits.chars().all(|c| c.is_ascii_digit())
        || digits.chars().all(|c| c == '0')
    {
        return Err(StreamError::validation(format!(
            "invalid bitrate '{}', expected e.g. 1000k",
            bitrate
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_resolution() {
        assert_eq!(
            "640x480".parse::<Resolution>().unwrap(),
            Resolution { width: 640, height: 480 }
        );
        assert_eq!("1280X720".parse::<Resolution>().unwrap().to_string(), "1280x720");
        assert!("640".parse::<Resolution>().is_err());
        assert!("0x480".parse::<Resolution>().is_err());
        assert!("-1x480".parse::<Resolution>().is_err());
        assert!("axb".parse::<Resolution>().is_err());
    }

    #[test]
    fn test_legacy_video_source_spelling() {
        let cfg: StreamConfig =
            serde_json::from_str(r#"{"source_type":"video","video_path":"/tmp/a.mp4"}"#).unwrap();
        assert_eq!(cfg.source_type, SourceKind::File);
        assert_eq!(cfg.source_path(), Some(Path::new("/tmp/a.mp4")));
        assert_eq!(cfg.resolution.to_string(), "640x480");
    }

    #[test]
    fn test_validate_rejects_bad_fields() {
        let mut cfg = StreamConfig::mjpg_default();
        assert!(cfg.validate(StreamKind::Mjpg).is_ok());

        cfg.port = 80;
        assert_eq!(cfg.validate(StreamKind::Mjpg).unwrap_err().kind(), "validation");

        let mut cfg = StreamConfig::mjpg_default();
        cfg.framerate = 0;
        assert!(cfg.validate(StreamKind::Mjpg).is_err());

        let mut cfg = StreamConfig::rtsp_default();
        cfg.bitrate = "fast".into();
        assert!(cfg.validate(StreamKind::Rtsp).is_err());
        cfg.bitrate = "2M".into();
        assert!(cfg.validate(StreamKind::Rtsp).is_ok());

        let mut cfg = StreamConfig::mjpg_default();
        cfg.source_type = SourceKind::File;
        assert!(cfg.validate(StreamKind::Mjpg).is_err());
    }

    #[test]
    fn test_auth_enabled_with_empty_password_is_rejected() {
        let mut cfg = StreamConfig::mjpg_default();
        cfg.auth_enabled = true;
        cfg.auth_password.clear();
        let err = cfg.validate(StreamKind::Mjpg).unwrap_err();
        assert_eq!(err.kind(), "validation");

        cfg.auth_enabled = false;
        assert!(cfg.validate(StreamKind::Mjpg).is_ok());
    }

    #[test]
    fn test_missing_sources_are_preconditions() {
        let mut cfg = StreamConfig::rtsp_default();
        cfg.source_type = SourceKind::File;
        cfg.video_path = Some(PathBuf::from("/nonexistent/clip.mp4"));
        let err = cfg.ensure_source_exists().unwrap_err();
        assert_eq!(err.to_string(), "video not found: /nonexistent/clip.mp4");

        cfg.source_type = SourceKind::Device;
        cfg.device = PathBuf::from("/dev/video-missing");
        let err = cfg.ensure_source_exists().unwrap_err();
        assert_eq!(err.to_string(), "device not found: /dev/video-missing");
    }

    #[test]
    fn test_secrets_include_encoded_password() {
        let mut cfg = StreamConfig::rtsp_default();
        cfg.auth_password = "p@ss word".into();
        assert_eq!(cfg.secrets(), ["p@ss word", "p%40ss%20word"]);

        cfg.auth_password = "plain".into();
        assert_eq!(cfg.secrets(), ["plain"]);

        cfg.auth_enabled = false;
        assert!(cfg.secrets().is_empty());
    }

    #[test]
    fn test_masked_hides_password() {
        let cfg = StreamConfig::mjpg_default().masked();
        assert_eq!(cfg.auth_password, MASK);
    }
}
