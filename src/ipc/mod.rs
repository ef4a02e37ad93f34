//! 基于文件投递的任务 IPC
//!
//! 每个群一个命名空间 `ipc/<folder>/`，容器内挂载为 /workspace/ipc：
//! - `tasks/<requestId>.json`：会话写入、宿主轮询认领的请求
//! - `delegation_results/<requestId>.json` / `<requestId>.error.json`：宿主写回、会话轮询消费的结果
//!
//! 所有写入先落临时文件再 rename，读方永远看不到半个文件。

mod protocol;
mod result_channel;
mod state;
mod task_channel;
mod watcher;

use std::path::{Path, PathBuf};

pub use protocol::{validate_request_id, DelegateTask, DelegationOutcome, TaskRequest};
pub use result_channel::ResultChannel;
pub use state::{RequestLedger, RequestRecord, RequestState};
pub use task_channel::{ClaimedTask, TaskChannel};
pub use watcher::TaskWatcher;

const TASKS_DIR: &str = "tasks";
const RESULTS_DIR: &str = "delegation_results";

/// 宿主侧的 IPC 根目录（data/ipc）
#[derive(Debug, Clone)]
pub struct IpcLayout {
    root: PathBuf,
}

impl IpcLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn group(&self, folder: &str) -> GroupIpc {
        GroupIpc::new(self.root.join(folder))
    }
}

/// 单个群的 IPC 命名空间；容器内通过 HIVE_IPC_DIR 指向同一目录
#[derive(Debug, Clone)]
pub struct GroupIpc {
    dir: PathBuf,
}

impl GroupIpc {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn tasks(&self) -> TaskChannel {
        TaskChannel::new(self.dir.join(TASKS_DIR))
    }

    pub fn results(&self) -> ResultChannel {
        ResultChannel::new(self.dir.join(RESULTS_DIR))
    }

    pub fn ensure(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(self.dir.join(TASKS_DIR))?;
        std::fs::create_dir_all(self.dir.join(RESULTS_DIR))?;
        Ok(())
    }
}
