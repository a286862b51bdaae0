use super::ApiResponse;
use crate::error::StreamError;
use crate::state::SharedState;
use axum::{
    extract::{multipart::Field, Multipart, State},
    Json,
};
use serde::{Deserialize, Serialize};
use std::path::{Component, Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::{error, info, warn};

#[derive(Debug, Serialize)]
pub struct VideoEntry {
    pub name: String,
    pub path: String,
    /// 如 `12.3 MB`
    pub size: String,
    pub bytes: u64,
}

#[derive(Debug, Serialize)]
pub struct VideoList {
    pub videos: Vec<VideoEntry>,
}

/// 扫描视频库目录，只保留 MIME 为 `video/*` 的文件，按名称排序
pub async fn scan_videos(dir: &Path) -> Vec<VideoEntry> {
    if let Err(e) = tokio::fs::create_dir_all(dir).await {
        warn!("Cannot create video dir {}: {}", dir.display(), e);
        return Vec::new();
    }
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(rd) => rd,
        Err(e) => {
            warn!("Cannot read video dir {}: {}", dir.display(), e);
            return Vec::new();
        }
    };

    let mut videos = Vec::new();
    while let Ok(Some(entry)) = entries.next_entry().await {
        let path = entry.path();
        let is_video = mime_guess::from_path(&path)
            .first()
            .map(|m| m.type_() == mime_guess::mime::VIDEO)
            .unwrap_or(false);
        if !is_video {
            continue;
        }
        let Ok(meta) = entry.metadata().await else {
            continue;
        };
        if !meta.is_file() {
            continue;
        }
        videos.push(VideoEntry {
            name: entry.file_name().to_string_lossy().into_owned(),
            path: path.to_string_lossy().into_owned(),
            size: format!("{:.1} MB", meta.len() as f64 / (1024.0 * 1024.0)),
            bytes: meta.len(),
        });
    }
    videos.sort_by(|a, b| a.name.cmp(&b.name));
    videos
}

/// 视频列表 API
pub async fn list_videos(State(state): State<SharedState>) -> Json<VideoList> {
    Json(VideoList {
        videos: scan_videos(&state.config.server.video_dir).await,
    })
}

#[derive(Debug, Deserialize)]
pub struct DeleteRequest {
    #[serde(default)]
    pub filename: String,
}

/// 只接受视频库目录下的单个文件名
fn plain_file_name(name: &str) -> bool {
    let mut components = Path::new(name).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    )
}

fn is_video(name: &str) -> bool {
    mime_guess::from_path(name)
        .first()
        .map(|m| m.type_() == mime_guess::mime::VIDEO)
        .unwrap_or(false)
}

/// 上传视频 API，表单字段 `video`
///
/// 内容分块写入库目录下的隐藏临时文件，完整接收后才改名为目标文件；
/// 同名文件会被覆盖。
pub async fn upload_video(State(state): State<SharedState>, mut multipart: Multipart) -> ApiResponse {
    let video_dir = &state.config.server.video_dir;
    loop {
        let mut field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(e) => return StreamError::validation(format!("invalid upload: {}", e)).into(),
        };
        if field.name() != Some("video") {
            continue;
        }

        let name = field.file_name().unwrap_or_default().trim().to_string();
        if name.is_empty() {
            return StreamError::validation("missing file name").into();
        }
        if !plain_file_name(&name) {
            warn!("Rejected video upload outside library: {:?}", name);
            return StreamError::validation("invalid path").into();
        }
        if !is_video(&name) {
            return StreamError::validation(format!("unsupported format: {}", name)).into();
        }

        let dest = video_dir.join(&name);
        return match receive(&mut field, &dest).await {
            Ok(bytes) => {
                info!("Uploaded video {} ({} bytes)", dest.display(), bytes);
                ApiResponse {
                    path: Some(dest.to_string_lossy().into_owned()),
                    ..ApiResponse::ok()
                }
            }
            Err(e) => {
                error!("Upload of {} failed: {}", name, e);
                ApiResponse::fail(format!("upload of {} failed: {}", name, e))
            }
        };
    }
    StreamError::validation("no file selected").into()
}

/// 分块接收到 `.<name>.part`，成功后改名为 `dest`；失败时删除半成品
async fn receive(field: &mut Field<'_>, dest: &Path) -> std::io::Result<u64> {
    if let Some(dir) = dest.parent() {
        tokio::fs::create_dir_all(dir).await?;
    }
    let part = partial_path(dest);
    let result = match write_chunks(field, &part).await {
        Ok(bytes) => tokio::fs::rename(&part, dest).await.map(|()| bytes),
        Err(e) => Err(e),
    };
    if result.is_err() {
        let _ = tokio::fs::remove_file(&part).await;
    }
    result
}

async fn write_chunks(field: &mut Field<'_>, part: &Path) -> std::io::Result<u64> {
    let mut file = tokio::fs::File::create(part).await?;
    let mut written = 0u64;
    while let Some(chunk) = field.chunk().await.map_err(std::io::Error::other)? {
        file.write_all(&chunk).await?;
        written += chunk.len() as u64;
    }
    file.flush().await?;
    Ok(written)
}

fn partial_path(dest: &Path) -> PathBuf {
    let mut name = std::ffi::OsString::from(".");
    name.push(dest.file_name().unwrap_or_default());
    name.push(".part");
    dest.with_file_name(name)
}

/// 删除视频 API
pub async fn delete_video(
    State(state): State<SharedState>,
    Json(req): Json<DeleteRequest>,
) -> ApiResponse {
    let name = req.filename.trim();
    if name.is_empty() {
        return StreamError::validation("missing file name").into();
    }
    if !plain_file_name(name) {
        warn!("Rejected video delete outside library: {:?}", name);
        return StreamError::validation("invalid path").into();
    }

    let path = state.config.server.video_dir.join(name);
    if !path.is_file() {
        return StreamError::precondition(format!("video not found: {}", name)).into();
    }
    match tokio::fs::remove_file(&path).await {
        Ok(()) => {
            info!("Deleted video {}", path.display());
            ApiResponse::ok()
        }
        Err(e) => ApiResponse::fail(format!("cannot delete {}: {}", name, e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::state::AppState;
    use crate::store::ConfigStore;
    use axum::body::Body;
    use axum::extract::FromRequest;
    use axum::http::{header::CONTENT_TYPE, Request};
    use std::sync::Arc;

    #[test]
    fn test_plain_file_name() {
        assert!(plain_file_name("clip.mp4"));
        assert!(plain_file_name("my clip.mkv"));
        assert!(!plain_file_name("../clip.mp4"));
        assert!(!plain_file_name("sub/clip.mp4"));
        assert!(!plain_file_name("/etc/passwd"));
        assert!(!plain_file_name(".."));
    }

    #[tokio::test]
    async fn test_scan_keeps_only_videos() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b.mkv"), vec![0u8; 2048]).unwrap();
        std::fs::write(dir.path().join("a.mp4"), b"").unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"x").unwrap();
        std::fs::create_dir(dir.path().join("nested.mp4")).unwrap();

        let videos = scan_videos(dir.path()).await;
        let names: Vec<_> = videos.iter().map(|v| v.name.as_str()).collect();
        assert_eq!(names, ["a.mp4", "b.mkv"]);
        assert_eq!(videos[1].bytes, 2048);
        assert_eq!(videos[0].size, "0.0 MB");
    }

    fn library(dir: &Path) -> SharedState {
        let mut config = AppConfig::default();
        config.server.video_dir = dir.join("videos");
        std::fs::create_dir_all(&config.server.video_dir).unwrap();
        let store = ConfigStore::open(dir.join("stream_config.json")).unwrap();
        Arc::new(AppState::new(config, store))
    }

    /// 浏览器提交的 multipart 表单
    async fn upload_form(field: &str, filename: &str, content: &[u8]) -> Multipart {
        const BOUNDARY: &str = "stream-panel-boundary";
        let mut body = format!(
            "--{b}\r\nContent-Disposition: form-data; name=\"{f}\"; filename=\"{n}\"\r\nContent-Type: application/octet-stream\r\n\r\n",
            b = BOUNDARY,
            f = field,
            n = filename
        )
        .into_bytes();
        body.extend_from_slice(content);
        body.extend_from_slice(format!("\r\n--{}--\r\n", BOUNDARY).as_bytes());

        let request = Request::builder()
            .method("POST")
            .header(CONTENT_TYPE, format!("multipart/form-data; boundary={}", BOUNDARY))
            .body(Body::from(body))
            .unwrap();
        Multipart::from_request(request, &()).await.unwrap()
    }

    #[tokio::test]
    async fn test_upload_stores_video_in_library() {
        let dir = tempfile::tempdir().unwrap();
        let state = library(dir.path());

        let form = upload_form("video", "clip.mp4", &[7u8; 4096]).await;
        let resp = upload_video(State(state.clone()), form).await;
        assert!(resp.success, "{:?}", resp);
        let stored = dir.path().join("videos/clip.mp4");
        assert_eq!(resp.path.as_deref(), Some(stored.to_str().unwrap()));
        assert_eq!(std::fs::read(&stored).unwrap(), vec![7u8; 4096]);

        // 没有留下半成品，且新文件出现在列表里
        let names: Vec<_> = std::fs::read_dir(dir.path().join("videos"))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, ["clip.mp4"]);
        assert_eq!(scan_videos(&dir.path().join("videos")).await.len(), 1);
    }

    #[tokio::test]
    async fn test_upload_rejects_bad_names_and_formats() {
        let dir = tempfile::tempdir().unwrap();
        let state = library(dir.path());

        let resp = upload_video(State(state.clone()), upload_form("video", "../escape.mp4", b"x").await).await;
        assert_eq!(resp.kind, Some("validation"));
        assert!(!dir.path().join("escape.mp4").exists());

        let resp = upload_video(State(state.clone()), upload_form("video", "notes.txt", b"x").await).await;
        assert_eq!(resp.kind, Some("validation"));
        assert!(resp.error.unwrap().contains("unsupported format"));

        let resp = upload_video(State(state.clone()), upload_form("other", "clip.mp4", b"x").await).await;
        assert_eq!(resp.error.as_deref(), Some("invalid configuration: no file selected"));

        assert_eq!(std::fs::read_dir(dir.path().join("videos")).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_delete_rejects_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let state = library(dir.path());
        std::fs::write(dir.path().join("videos/clip.mp4"), b"").unwrap();
        std::fs::write(dir.path().join("outside.mp4"), b"").unwrap();

        let resp = delete_video(
            State(state.clone()),
            Json(DeleteRequest {
                filename: "../outside.mp4".into(),
            }),
        )
        .await;
        assert_eq!(resp.kind, Some("validation"));
        assert!(dir.path().join("outside.mp4").exists());

        let resp = delete_video(
            State(state.clone()),
            Json(DeleteRequest {
                filename: "clip.mp4".into(),
            }),
        )
        .await;
        assert!(resp.success);
        assert!(!dir.path().join("videos/clip.mp4").exists());
    }
}
