use std::path::Path;
use tokio::fs;
use tracing::{debug, warn};

fn is_frame(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.eq_ignore_ascii_case("jpg") || e.eq_ignore_ascii_case("jpeg"))
        .unwrap_or(false)
}

/// 确保暂存目录存在并清空旧帧，返回删除的文件数
///
/// 单个文件删除失败只记录日志，从不让调用方失败。
pub async fn reset(dir: &Path) -> usize {
    if let Err(e) = fs::create_dir_all(dir).await {
        warn!("Failed to create staging dir {:?}: {}", dir, e);
        return 0;
    }
    purge(dir).await
}

/// 删除目录中的 jpg/jpeg，目录不存在时什么也不做
pub async fn purge(dir: &Path) -> usize {
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) => {
            debug!("Staging dir {:?} not readable: {}", dir, e);
            return 0;
        }
    };

    let mut removed = 0;
    loop {
        let entry = match entries.next_entry().await {
            Ok(Some(entry)) => entry,
            Ok(None) => break,
            Err(e) => {
                warn!("Error while listing {:?}: {}", dir, e);
                break;
            }
        };
        let path = entry.path();
        if !is_frame(&path) {
            continue;
        }
        match fs::remove_file(&path).await {
            Ok(()) => removed += 1,
            Err(e) => warn!("Failed to remove stale frame {:?}: {}", path, e),
        }
    }

    if removed > 0 {
        debug!("Removed {} stale frame(s) from {:?}", removed, dir);
    }
    removed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_reset_creates_dir_and_removes_only_frames() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("frames");

        assert_eq!(reset(&dir).await, 0);
        assert!(dir.is_dir());

        std::fs::write(dir.join("frame_000001.jpg"), b"x").unwrap();
        std::fs::write(dir.join("frame_000002.JPEG"), b"x").unwrap();
        std::fs::write(dir.join("notes.txt"), b"keep").unwrap();

        assert_eq!(reset(&dir).await, 2);
        assert!(dir.join("notes.txt").exists());
        assert!(!dir.join("frame_000001.jpg").exists());
    }

    #[tokio::test]
    async fn test_purge_missing_dir_is_noop() {
        let root = tempfile::tempdir().unwrap();
        assert_eq!(purge(&root.path().join("absent")).await, 0);
    }
}
