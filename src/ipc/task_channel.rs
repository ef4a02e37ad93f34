//! 任务通道：会话写入请求文件，宿主认领
//!
//! 认领 = 把 `<id>.json` rename 进 `.processing/`。rename 在同一文件系统上是原子的，
//! 两个并发的 claim_next 对同一个文件只有一个会成功，另一个拿到 NotFound 后跳过。
//! 认领后立即读取并删除：宿主在处理完之前崩溃，这个请求就丢了（至多一次）。

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use tokio::fs;

use super::protocol::TaskRequest;
use crate::core::{DelegationError, HiveError};

const PROCESSING_DIR: &str = ".processing";

/// 已从磁盘取走的一个请求文件
#[derive(Debug, Clone)]
pub struct ClaimedTask {
    pub file_name: String,
    pub raw: String,
}

impl ClaimedTask {
    pub fn parse(&self) -> Result<TaskRequest, DelegationError> {
        TaskRequest::parse(&self.raw)
    }

    pub fn recover_request_id(&self) -> Option<String> {
        TaskRequest::recover_request_id(&self.raw)
    }
}

#[derive(Debug, Clone)]
pub struct TaskChannel {
    dir: PathBuf,
}

impl TaskChannel {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn processing_dir(&self) -> PathBuf {
        self.dir.join(PROCESSING_DIR)
    }

    /// 持久化一个请求；返回最终文件路径
    pub async fn submit(&self, request: &TaskRequest) -> Result<PathBuf, HiveError> {
        fs::create_dir_all(&self.dir).await?;
        let id = request.request_id();
        let path = self.dir.join(format!("{}.json", id));
        let tmp = self.dir.join(format!("{}.json.tmp", id));
        fs::write(&tmp, serde_json::to_vec(request)?).await?;
        fs::rename(&tmp, &path).await?;
        tracing::debug!(request_id = %id, kind = request.kind(), "task submitted");
        Ok(path)
    }

    /// 认领最早的一个未认领请求；目录不存在或为空时返回 None
    pub async fn claim_next(&self) -> Result<Option<ClaimedTask>, HiveError> {
        for (name, path) in self.pending_files().await? {
            let processing = self.processing_dir();
            fs::create_dir_all(&processing).await?;
            let claimed_path = processing.join(format!("{}.{}", name, uuid::Uuid::new_v4()));

            match fs::rename(&path, &claimed_path).await {
                Ok(()) => {}
                // 被另一个认领者抢先
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            }

            let bytes = fs::read(&claimed_path).await;
            fs::remove_file(&claimed_path).await?;
            let raw = String::from_utf8_lossy(&bytes?).into_owned();
            return Ok(Some(ClaimedTask { file_name: name, raw }));
        }
        Ok(None)
    }

    /// 当前可认领的请求数
    pub async fn pending(&self) -> Result<usize, HiveError> {
        Ok(self.pending_files().await?.len())
    }

    /// 清理上次崩溃时认领了却没处理完的文件
    pub async fn discard_orphans(&self) -> Result<usize, HiveError> {
        let mut entries = match fs::read_dir(self.processing_dir()).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };
        let mut removed = 0;
        while let Some(entry) = entries.next_entry().await? {
            tracing::warn!(file = %entry.path().display(), "discarding orphaned claimed task");
            fs::remove_file(entry.path()).await?;
            removed += 1;
        }
        Ok(removed)
    }

    /// `*.json`，按修改时间、文件名排序
    async fn pending_files(&self) -> Result<Vec<(String, PathBuf)>, HiveError> {
        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.ends_with(".json") {
                continue;
            }
            let modified = match entry.metadata().await {
                Ok(meta) if meta.is_file() => meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
                _ => continue,
            };
            files.push((modified, name, entry.path()));
        }
        files.sort();
        Ok(files.into_iter().map(|(_, name, path)| (name, path)).collect())
    }
}
