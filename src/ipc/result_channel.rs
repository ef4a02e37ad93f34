//! 结果通道：宿主写回委派结果，请求方轮询消费
//!
//! 成功写 `<id>.json`，失败写 `<id>.error.json`，同一个 id 只会出现其中一个。
//! 消费 = rename 到临时名后读取并删除，保证只被读一次。
//! 请求方放弃等待后宿主仍可能写入结果；这类无人消费的文件在请求方下次启动时按年龄清理。

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tokio::fs;
use tokio::time::Instant;

use super::protocol::DelegationOutcome;
use crate::core::{DelegationError, HiveError};

#[derive(Debug, Clone)]
pub struct ResultChannel {
    dir: PathBuf,
}

impl ResultChannel {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn success_path(&self, request_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", request_id))
    }

    fn error_path(&self, request_id: &str) -> PathBuf {
        self.dir.join(format!("{}.error.json", request_id))
    }

    /// 写入结果；该 id 已有结果文件时不覆盖，返回 false
    pub async fn write_outcome(
        &self,
        request_id: &str,
        outcome: &DelegationOutcome,
    ) -> Result<bool, HiveError> {
        fs::create_dir_all(&self.dir).await?;
        let success = self.success_path(request_id);
        let error = self.error_path(request_id);
        if fs::try_exists(&success).await? || fs::try_exists(&error).await? {
            tracing::warn!(request_id = %request_id, "outcome already written, keeping the first one");
            return Ok(false);
        }

        let target = if outcome.is_success() { success } else { error };
        let tmp = self.dir.join(format!("{}.{}.tmp", request_id, uuid::Uuid::new_v4()));
        fs::write(&tmp, serde_json::to_vec(outcome)?).await?;
        fs::rename(&tmp, &target).await?;
        tracing::debug!(request_id = %request_id, file = %target.display(), "outcome written");
        Ok(true)
    }

    /// 取走结果（读后即删）；尚未写入时返回 Ok(None)
    pub async fn take(&self, request_id: &str) -> Result<Option<DelegationOutcome>, DelegationError> {
        for path in [self.success_path(request_id), self.error_path(request_id)] {
            let taking = self
                .dir
                .join(format!("{}.{}.taking", request_id, uuid::Uuid::new_v4()));
            match fs::rename(&path, &taking).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(DelegationError::Protocol(e.to_string())),
            }

            let raw = fs::read(&taking).await;
            let _ = fs::remove_file(&taking).await;
            let raw = raw.map_err(|e| DelegationError::Protocol(e.to_string()))?;
            let outcome = serde_json::from_slice::<DelegationOutcome>(&raw)
                .map_err(|e| DelegationError::Protocol(format!("malformed outcome: {}", e)))?;
            return Ok(Some(outcome));
        }
        Ok(None)
    }

    /// 以 poll_interval 轮询，直到取到结果或 timeout 到期
    ///
    /// 超时只代表请求方不再等待，宿主侧的执行不受影响。
    pub async fn await_result(
        &self,
        request_id: &str,
        poll_interval: Duration,
        timeout: Duration,
    ) -> Result<DelegationOutcome, DelegationError> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(outcome) = self.take(request_id).await? {
                return Ok(outcome);
            }
            let now = Instant::now();
            if now >= deadline {
                tracing::debug!(request_id = %request_id, "gave up waiting for outcome");
                return Err(DelegationError::Timeout(timeout.as_secs()));
            }
            tokio::time::sleep(poll_interval.min(deadline - now)).await;
        }
    }

    /// 删除修改时间早于 max_age 的结果/临时文件，返回删除数
    pub async fn purge_stale(&self, max_age: Duration) -> Result<usize, HiveError> {
        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let now = SystemTime::now();
        let mut removed = 0;
        while let Some(entry) = entries.next_entry().await? {
            let meta = entry.metadata().await?;
            if !meta.is_file() {
                continue;
            }
            let age = meta
                .modified()
                .ok()
                .and_then(|m| now.duration_since(m).ok())
                .unwrap_or_default();
            if age >= max_age {
                fs::remove_file(entry.path()).await?;
                removed += 1;
            }
        }
        if removed > 0 {
            tracing::info!(removed, dir = %self.dir.display(), "purged stale delegation outcomes");
        }
        Ok(removed)
    }
}
