//! C3 Chunked Transfer Manager (spec §4.3) — the most protocol-dense
//! component. No teacher module implements a file-transfer protocol of its
//! own (the teacher only ever moves clipboard text/small images), so this
//! is newly written, but it keeps the teacher's concurrency idiom
//! throughout: `Arc<parking_lot::RwLock<HashMap<...>>>` for the session map
//! (as `discovery.rs`'s `DiscoveredPeers`), and a session-scoped lock for
//! mutable per-session state (as `peer.rs`'s
//! `Arc<tokio::sync::Mutex<OwnedWriteHalf>>`).

use crate::config::Config;
use crate::error::ConnectError;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl UploadStatus {
    fn as_str(self) -> &'static str {
        match self {
            UploadStatus::Pending => "pending",
            UploadStatus::InProgress => "in-progress",
            UploadStatus::Completed => "completed",
            UploadStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct ChunkPlan {
    offset: u64,
    size: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChunkInfo {
    pub chunk_id: u32,
    pub chunk_size: u64,
    pub chunk_offset: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct UploadInfo {
    pub upload_id: String,
    pub filename: String,
    pub file_size: u64,
    pub chunk_size: u64,
    pub total_chunks: u32,
    pub chunks: Vec<ChunkInfo>,
    pub start_time: i64,
    pub end_time: Option<i64>,
    pub status: String,
}

struct SessionState {
    status: UploadStatus,
    received: Vec<bool>,
    received_count: u32,
    end_time: Option<i64>,
}

/// One resumable inbound transfer (spec §3 `UploadSession`).
pub struct UploadSession {
    upload_id: String,
    filename: String,
    file_size: u64,
    chunk_size: u64,
    plan: Vec<ChunkPlan>,
    temp_path: PathBuf,
    start_time: i64,
    state: Mutex<SessionState>,
}

impl UploadSession {
    fn chunk_count(&self) -> u32 {
        self.plan.len() as u32
    }

    fn snapshot(&self) -> UploadInfo {
        let state = self.state.lock();
        UploadInfo {
            upload_id: self.upload_id.clone(),
            filename: self.filename.clone(),
            file_size: self.file_size,
            chunk_size: self.chunk_size,
            total_chunks: self.chunk_count(),
            chunks: self
                .plan
                .iter()
                .enumerate()
                .map(|(id, plan)| ChunkInfo {
                    chunk_id: id as u32,
                    chunk_size: plan.size,
                    chunk_offset: plan.offset,
                })
                .collect(),
            start_time: self.start_time,
            end_time: state.end_time,
            status: state.status.as_str().to_string(),
        }
    }
}

type Sessions = Arc<RwLock<HashMap<String, Arc<UploadSession>>>>;

/// Owns all in-flight upload sessions and the per-process temporary
/// directory they are staged in.
pub struct TransferManager {
    sessions: Sessions,
    temp_dir: PathBuf,
    download_dir: PathBuf,
    chunk_size: u64,
}

impl TransferManager {
    pub fn new(download_dir: PathBuf, chunk_size: u64) -> anyhow::Result<Self> {
        let temp_dir = std::env::temp_dir().join(format!("connect-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&temp_dir)?;
        create_download_dir(&download_dir)?;
        Ok(Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            temp_dir,
            download_dir,
            chunk_size: Config::clamp_chunk_size(chunk_size),
        })
    }

    /// Allocate a fresh upload ID, compute the chunk plan, and preallocate
    /// the temporary file. Preallocation failure is logged, not fatal.
    pub fn init_upload(&self, filename: &str, file_size: u64) -> Result<UploadInfo, ConnectError> {
        let safe_name = sanitize_filename(filename);
        let upload_id = generate_upload_id();
        let plan = build_chunk_plan(file_size, self.chunk_size);

        let temp_path = self.temp_dir.join(&upload_id);
        let file = std::fs::File::create(&temp_path)
            .map_err(|e| ConnectError::InitFailed(e.to_string()))?;
        if let Err(e) = file.set_len(file_size) {
            log::warn!("transfer: failed to preallocate {file_size} bytes for {upload_id}: {e}");
        }
        drop(file);

        let status = if file_size == 0 {
            UploadStatus::Completed
        } else {
            UploadStatus::Pending
        };
        let received = vec![file_size == 0; plan.len()];

        let session = Arc::new(UploadSession {
            upload_id: upload_id.clone(),
            filename: safe_name,
            file_size,
            chunk_size: self.chunk_size,
            plan,
            temp_path,
            start_time: now_unix(),
            state: Mutex::new(SessionState {
                status,
                received_count: if file_size == 0 { 0 } else { 0 },
                received,
                end_time: None,
            }),
        });

        let info = session.snapshot();
        self.sessions.write().insert(upload_id, session);
        Ok(info)
    }

    /// Write one chunk at its planned offset using positional I/O. Acquires
    /// the session map in shared mode only — the write itself is not
    /// serialized against other chunks of the same session.
    pub async fn upload_chunk(
        &self,
        upload_id: &str,
        chunk_id: u32,
        data: Vec<u8>,
    ) -> Result<(), ConnectError> {
        let session = {
            let map = self.sessions.read();
            map.get(upload_id).cloned().ok_or(ConnectError::UnknownUpload)?
        };

        let plan = *session
            .plan
            .get(chunk_id as usize)
            .ok_or(ConnectError::BadChunkID)?;
        if data.len() as u64 != plan.size {
            return Err(ConnectError::BadChunkSize);
        }

        let path = session.temp_path.clone();
        let offset = plan.offset;
        tokio::task::spawn_blocking(move || write_at(&path, offset, &data))
            .await
            .map_err(|e| ConnectError::TempIOError(e.to_string()))?
            .map_err(|e| ConnectError::TempIOError(e.to_string()))?;

        let mut state = session.state.lock();
        if !state.received[chunk_id as usize] {
            state.received[chunk_id as usize] = true;
            state.received_count += 1;
        }
        if state.status == UploadStatus::Pending {
            state.status = UploadStatus::InProgress;
        }
        Ok(())
    }

    /// Finalize an upload: requires every chunk to have been received,
    /// renames the temp file into the download directory with a
    /// timestamp-suffixed name, and removes the session from the map.
    pub async fn complete_upload(&self, upload_id: &str) -> Result<PathBuf, ConnectError> {
        let session = {
            let map = self.sessions.read();
            map.get(upload_id).cloned().ok_or(ConnectError::UnknownUpload)?
        };

        {
            let state = session.state.lock();
            if state.received_count != session.chunk_count() {
                return Err(ConnectError::IncompleteUpload);
            }
        }

        let final_path = self
            .download_dir
            .join(timestamped_filename(&session.filename));
        let temp_path = session.temp_path.clone();
        let final_path_clone = final_path.clone();

        let move_result = tokio::task::spawn_blocking(move || move_file(&temp_path, &final_path_clone))
            .await
            .map_err(|e| ConnectError::MoveFailed(e.to_string()))?;

        let mut state = session.state.lock();
        match move_result {
            Ok(()) => {
                state.status = UploadStatus::Completed;
                state.end_time = Some(now_unix());
                drop(state);
                self.sessions.write().remove(upload_id);
                Ok(final_path)
            }
            Err(e) => {
                state.status = UploadStatus::Failed;
                Err(ConnectError::MoveFailed(e.to_string()))
            }
        }
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    /// Remove the per-process temporary directory. Invoked at shutdown.
    pub fn cleanup(&self) {
        if let Err(e) = std::fs::remove_dir_all(&self.temp_dir) {
            log::warn!("transfer: cleanup of {:?} failed: {e}", self.temp_dir);
        }
    }
}

/// Create the download directory with mode `0755` if absent (spec §4.4).
#[cfg(unix)]
fn create_download_dir(dir: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::DirBuilderExt;
    std::fs::DirBuilder::new().recursive(true).mode(0o755).create(dir)
}

#[cfg(not(unix))]
fn create_download_dir(dir: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dir)
}

fn sanitize_filename(filename: &str) -> String {
    Path::new(filename)
        .file_name()
        .map(|f| f.to_string_lossy().to_string())
        .unwrap_or_else(|| "upload.bin".to_string())
}

fn generate_upload_id() -> String {
    use rand::RngCore;
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

fn build_chunk_plan(file_size: u64, chunk_size: u64) -> Vec<ChunkPlan> {
    if file_size == 0 {
        return Vec::new();
    }
    let mut plan = Vec::new();
    let mut offset = 0u64;
    while offset < file_size {
        let remaining = file_size - offset;
        let size = remaining.min(chunk_size);
        plan.push(ChunkPlan { offset, size });
        offset += size;
    }
    plan
}

fn timestamped_filename(original: &str) -> String {
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
        _ => format!("upload_{}", now),
    }
}

#[cfg(unix)]
fn write_at(path: &Path, offset: u64, data: &[u8]) -> std::io::Result<()> {
    use std::os::unix::fs::FileExt;
    let file = std::fs::OpenOptions::new().write(true).open(path)?;
    file.write_all_at(data, offset)
}

#[cfg(windows)]
fn write_at(path: &Path, offset: u64, data: &[u8]) -> std::io::Result<()> {
    use std::os::windows::fs::FileExt;
    let file = std::fs::OpenOptions::new().write(true).open(path)?;
    let mut written = 0usize;
    while written < data.len() {
        let n = file.seek_write(&data[written..], offset + written as u64)?;
        written += n;
    }
    Ok(())
}

fn move_file(from: &Path, to: &Path) -> std::io::Result<()> {
    if let Some(parent) = to.parent() {
        std::fs::create_dir_all(parent)?;
    }
    match std::fs::rename(from, to) {
        Ok(()) => Ok(()),
        Err(_) => {
            // Cross-device move: fall back to copy + unlink.
            std::fs::copy(from, to)?;
            std::fs::remove_file(from)
        }
    }
}

fn now_unix() -> i64 {
    chrono::Utc::now().timestamp()
}

#[cfg(test)]
mod tests {
    use super::*;
    use sha2::{Digest, Sha256};

    fn manager() -> (TransferManager, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let manager = TransferManager::new(dir.path().to_path_buf(), 1024 * 1024).unwrap();
        (manager, dir)
    }

    #[test]
    fn chunk_plan_partitions_file_size() {
        let plan = build_chunk_plan(2_621_440, 1024 * 1024);
        assert_eq!(plan.len(), 3);
        assert_eq!((plan[0].offset, plan[0].size), (0, 1_048_576));
        assert_eq!((plan[1].offset, plan[1].size), (1_048_576, 1_048_576));
        assert_eq!((plan[2].offset, plan[2].size), (2_097_152, 524_288));
    }

    #[test]
    fn zero_size_file_yields_no_chunks() {
        let plan = build_chunk_plan(0, 1024 * 1024);
        assert!(plan.is_empty());
    }

    #[tokio::test]
    async fn happy_path_out_of_order_upload_round_trips() {
        let (manager, _dir) = manager();
        let info = manager.init_upload("foo.bin", 2_621_440).unwrap();
        assert_eq!(info.total_chunks, 3);

        let chunk0 = vec![1u8; 1_048_576];
        let chunk1 = vec![2u8; 1_048_576];
        let chunk2 = vec![3u8; 524_288];

        // Out-of-order: 2, 0, 1.
        manager
            .upload_chunk(&info.upload_id, 2, chunk2.clone())
            .await
            .unwrap();
        manager
            .upload_chunk(&info.upload_id, 0, chunk0.clone())
            .await
            .unwrap();
        manager
            .upload_chunk(&info.upload_id, 1, chunk1.clone())
            .await
            .unwrap();

        let final_path = manager.complete_upload(&info.upload_id).await.unwrap();
        let bytes = std::fs::read(&final_path).unwrap();

        let mut expected = Vec::new();
        expected.extend_from_slice(&chunk0);
        expected.extend_from_slice(&chunk1);
        expected.extend_from_slice(&chunk2);

        let mut expected_hash = Sha256::new();
        expected_hash.update(&expected);
        let mut actual_hash = Sha256::new();
        actual_hash.update(&bytes);
        assert_eq!(expected_hash.finalize(), actual_hash.finalize());
    }

    #[tokio::test]
    async fn upload_chunk_is_idempotent_on_identical_input() {
        let (manager, _dir) = manager();
        let info = manager.init_upload("a.bin", 1024 * 1024).unwrap();
        let data = vec![7u8; 1024 * 1024];
        manager
            .upload_chunk(&info.upload_id, 0, data.clone())
            .await
            .unwrap();
        manager
            .upload_chunk(&info.upload_id, 0, data)
            .await
            .unwrap();
        let path = manager.complete_upload(&info.upload_id).await.unwrap();
        assert!(path.exists());
    }

    #[tokio::test]
    async fn upload_chunk_rejects_bad_size_without_mutating_state() {
        let (manager, _dir) = manager();
        let info = manager.init_upload("a.bin", 1024 * 1024).unwrap();
        let wrong = vec![0u8; 10];
        let result = manager.upload_chunk(&info.upload_id, 0, wrong).await;
        assert!(matches!(result, Err(ConnectError::BadChunkSize)));

        let complete = manager.complete_upload(&info.upload_id).await;
        assert!(matches!(complete, Err(ConnectError::IncompleteUpload)));
    }

    #[tokio::test]
    async fn upload_chunk_rejects_unknown_chunk_id() {
        let (manager, _dir) = manager();
        let info = manager.init_upload("a.bin", 1024 * 1024).unwrap();
        let result = manager
            .upload_chunk(&info.upload_id, 5, vec![0u8; 1024 * 1024])
            .await;
        assert!(matches!(result, Err(ConnectError::BadChunkID)));
    }

    #[tokio::test]
    async fn unknown_upload_id_is_rejected() {
        let (manager, _dir) = manager();
        let result = manager.upload_chunk("does-not-exist", 0, vec![]).await;
        assert!(matches!(result, Err(ConnectError::UnknownUpload)));
    }

    #[tokio::test]
    async fn zero_size_upload_completes_to_empty_file() {
        let (manager, _dir) = manager();
        let info = manager.init_upload("empty.bin", 0).unwrap();
        assert_eq!(info.total_chunks, 0);
        let path = manager.complete_upload(&info.upload_id).await.unwrap();
        let bytes = std::fs::read(&path).unwrap();
        assert!(bytes.is_empty());
    }

    #[test]
    fn sanitize_filename_strips_path_components() {
        assert_eq!(sanitize_filename("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_filename("report.pdf"), "report.pdf");
    }
}
