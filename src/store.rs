use crate::stream::{StreamConfig, StreamKind};
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::info;

/// 持久化的流配置文档，每种流一个分区
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredConfig {
    #[serde(default = "StreamConfig::mjpg_default")]
    pub mjpg: StreamConfig,
    #[serde(default = "StreamConfig::rtsp_default")]
    pub rtsp: StreamConfig,
}

impl Default for StoredConfig {
    fn default() -> Self {
        Self {
            mjpg: StreamConfig::mjpg_default(),
            rtsp: StreamConfig::rtsp_default(),
        }
    }
}

impl StoredConfig {
    pub fn get(&self, kind: StreamKind) -> &StreamConfig {
        match kind {
            StreamKind::Mjpg => &self.mjpg,
            StreamKind::Rtsp => &self.rtsp,
        }
    }

    pub fn get_mut(&mut self, kind: StreamKind) -> &mut StreamConfig {
        match kind {
            StreamKind::Mjpg => &mut self.mjpg,
            StreamKind::Rtsp => &mut self.rtsp,
        }
    }

    pub fn masked(&self) -> Self {
        Self {
            mjpg: self.mjpg.masked(),
            rtsp: self.rtsp.masked(),
        }
    }
}

/// JSON 文件支持的配置存储
pub struct ConfigStore {
    path: PathBuf,
    doc: Mutex<StoredConfig>,
}

impl ConfigStore {
    /// 读取配置；文件不存在时写入默认值
    pub fn open<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let doc = if path.exists() {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            serde_json::from_str(&content).with_context(|| format!("parsing {}", path.display()))?
        } else {
            info!("No stream config at {}, writing defaults", path.display());
            let doc = StoredConfig::default();
            write_atomic(&path, &doc)?;
            doc
        };
        Ok(Self {
            path,
            doc: Mutex::new(doc),
        })
    }

    pub fn snapshot(&self) -> StoredConfig {
        self.doc.lock().unwrap().clone()
    }

    pub fn stream(&self, kind: StreamKind) -> StreamConfig {
        self.doc.lock().unwrap().get(kind).clone()
    }

    /// 修改并落盘；写盘失败时内存中的文档保持不变
    pub fn update<F>(&self, f: F) -> anyhow::Result<()>
    where
        F: FnOnce(&mut StoredConfig),
    {
        let mut doc = self.doc.lock().unwrap();
        let mut next = doc.clone();
        f(&mut next);
        if next != *doc {
            write_atomic(&self.path, &next)?;
            *doc = next;
        }
        Ok(())
    }
}

fn write_atomic(path: &Path, doc: &StoredConfig) -> anyhow::Result<()> {
    let json = serde_json::to_string_pretty(doc)?;
    let mut tmp = path.as_os_str().to_os_string();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    std::fs::write(&tmp, json).with_context(|| format!("writing {}", tmp.display()))?;
    std::fs::rename(&tmp, path).with_context(|| format!("installing {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_writes_defaults_and_persists_updates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stream_config.json");

        let store = ConfigStore::open(&path).unwrap();
        assert!(path.exists());
        assert_eq!(store.stream(StreamKind::Rtsp).port, 8554);

        store
            .update(|doc| doc.mjpg.video_path = Some("/videos/loop.mp4".into()))
            .unwrap();

        let reopened = ConfigStore::open(&path).unwrap();
        assert_eq!(
            reopened.stream(StreamKind::Mjpg).video_path,
            Some(PathBuf::from("/videos/loop.mp4"))
        );
    }

    #[test]
    fn test_legacy_document_with_missing_sections() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stream_config.json");
        std::fs::write(
            &path,
            r#"{"mjpg": {"source_type": "video", "video_path": "/v/a.mp4", "port": 8090}, "video": {"loop": true}}"#,
        )
        .unwrap();

        let store = ConfigStore::open(&path).unwrap();
        let doc = store.snapshot();
        assert_eq!(doc.mjpg.port, 8090);
        assert_eq!(doc.rtsp, StreamConfig::rtsp_default());
        assert_eq!(doc.masked().mjpg.auth_password, crate::error::MASK);
    }
}
