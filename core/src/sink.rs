//! C5 File Sink (spec §4.4).

use std::path::{Path, PathBuf};

/// Persist `bytes` under `download_dir` as `filename` (path components
/// stripped, timestamp-suffixed). Falls back to the current working
/// directory if the configured directory can't be created or written to,
/// logging the degradation; the caller always gets back the path that was
/// actually used.
pub async fn persist(download_dir: &Path, filename: &str, bytes: &[u8]) -> anyhow::Result<PathBuf> {
    let safe_name = sanitize(filename);
    let named = timestamp_suffixed(&safe_name);

    if let Err(e) = create_download_dir(download_dir).await {
        log::warn!(
            "sink: could not create download dir {:?}: {e}; falling back to cwd",
            download_dir
        );
        return persist_to_fallback(&named, bytes).await;
    }

    let target = download_dir.join(&named);
    match tokio::fs::write(&target, bytes).await {
        Ok(()) => {
            set_permissive_mode(&target);
            Ok(target)
        }
        Err(e) => {
            log::warn!("sink: write to {:?} failed: {e}; falling back to cwd", target);
            persist_to_fallback(&named, bytes).await
        }
    }
}

/// Create the download directory with mode `0755` if absent (spec §4.4).
#[cfg(unix)]
async fn create_download_dir(dir: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::DirBuilderExt;
    let dir = dir.to_path_buf();
    tokio::task::spawn_blocking(move || {
        std::fs::DirBuilder::new().recursive(true).mode(0o755).create(&dir)
    })
    .await
    .unwrap_or_else(|e| Err(std::io::Error::new(std::io::ErrorKind::Other, e)))
}

#[cfg(not(unix))]
async fn create_download_dir(dir: &Path) -> std::io::Result<()> {
    tokio::fs::create_dir_all(dir).await
}

async fn persist_to_fallback(named: &str, bytes: &[u8]) -> anyhow::Result<PathBuf> {
    let cwd = std::env::current_dir()?;
    let target = cwd.join(named);
    tokio::fs::write(&target, bytes).await?;
    set_permissive_mode(&target);
    Ok(target)
}

fn sanitize(filename: &str) -> String {
    Path::new(filename)
        .file_name()
        .map(|f| f.to_string_lossy().to_string())
        .unwrap_or_else(|| "received.bin".to_string())
}

fn timestamp_suffixed(original: &str) -> String {
    let now = chrono::Local::now().format("%Y%m%d_%H%M%S");
    let path = Path::new(original);
    match (path.file_stem(), path.extension()) {
        (Some(stem), Some(ext)) => format!(
            "{}_{}.{}",
            stem.to_string_lossy(),
            now,
            ext.to_string_lossy()
        ),
        (Some(stem), None) => format!("{}_{}", stem.to_string_lossy(), now),
        _ => format!("received_{}", now),
    }
}

#[cfg(unix)]
fn set_permissive_mode(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    if let Ok(meta) = std::fs::metadata(path) {
        let mut perms = meta.permissions();
        perms.set_mode(0o644);
        let _ = std::fs::set_permissions(path, perms);
    }
}

#[cfg(windows)]
fn set_permissive_mode(_path: &Path) {}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn persist_strips_path_components_and_creates_dir() {
        let dir = tempfile::tempdir().unwrap();
        let target_dir = dir.path().join("nested").join("downloads");
        let path = persist(&target_dir, "../../etc/report.pdf", b"hello")
            .await
            .unwrap();
        assert!(path.starts_with(&target_dir));
        assert!(path.file_name().unwrap().to_string_lossy().starts_with("report_"));
        let contents = tokio::fs::read(&path).await.unwrap();
        assert_eq!(contents, b"hello");
    }

    #[test]
    fn sanitize_rejects_directory_traversal() {
        assert_eq!(sanitize("../../secret"), "secret");
    }
}
