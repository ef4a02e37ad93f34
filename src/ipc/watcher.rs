//! 宿主侧任务轮询
//!
//! 按固定间隔扫描每个已注册群的 `tasks/`，认领请求后交给委派协调器在独立任务里执行。
//! 请求的来源群以它所在的目录为准，报文里的 sourceGroup 对不上就拒绝。

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::task_channel::ClaimedTask;
use super::{IpcLayout, TaskRequest};
use crate::core::DelegationError;
use crate::delegation::DelegationCoordinator;
use crate::groups::GroupRegistry;

pub struct TaskWatcher {
    layout: IpcLayout,
    registry: Arc<GroupRegistry>,
    coordinator: Arc<DelegationCoordinator>,
    poll_interval: Duration,
    tracker: TaskTracker,
}

impl TaskWatcher {
    pub fn new(
        layout: IpcLayout,
        registry: Arc<GroupRegistry>,
        coordinator: Arc<DelegationCoordinator>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            layout,
            registry,
            coordinator,
            poll_interval,
            tracker: TaskTracker::new(),
        }
    }

    /// 启动前清理：建好各群 IPC 目录，丢弃上次崩溃遗留的已认领文件
    pub async fn prepare(&self) -> usize {
        let mut discarded = 0;
        for folder in self.registry.folders().await {
            let group = self.layout.group(&folder);
            if let Err(e) = group.ensure() {
                tracing::warn!(group = %folder, error = %e, "cannot create ipc directories");
                continue;
            }
            match group.tasks().discard_orphans().await {
                Ok(n) => discarded += n,
                Err(e) => tracing::warn!(group = %folder, error = %e, "orphan cleanup failed"),
            }
        }
        discarded
    }

    /// 轮询直到 shutdown 触发；已派发的委派不会被打断，交给 drain 等待
    pub async fn run(&self, shutdown: CancellationToken) {
        let discarded = self.prepare().await;
        tracing::info!(
            poll_interval_ms = self.poll_interval.as_millis() as u64,
            discarded,
            "task watcher started"
        );

        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    self.poll_once().await;
                    self.coordinator.ledger().prune(Utc::now()).await;
                }
            }
        }
        let unfinished_requests = self.coordinator.ledger().in_flight().await;
        tracing::info!(
            in_flight = self.tracker.len(),
            unfinished_requests,
            "task watcher stopped polling"
        );
    }

    /// 扫描一轮，返回本轮认领的请求数
    ///
    /// 每轮先同步注册表，管理命令新注册或注销的群在下一轮生效。
    pub async fn poll_once(&self) -> usize {
        match self.registry.refresh().await {
            Ok(true) => {
                for folder in self.registry.folders().await {
                    if let Err(e) = self.layout.group(&folder).ensure() {
                        tracing::warn!(group = %folder, error = %e, "cannot create ipc directories");
                    }
                }
            }
            Ok(false) => {}
            Err(e) => tracing::warn!(error = %e, "failed to reload registered groups"),
        }

        let mut claimed = 0;
        for folder in self.registry.folders().await {
            let channel = self.layout.group(&folder).tasks();
            loop {
                match channel.claim_next().await {
                    Ok(Some(task)) => {
                        claimed += 1;
                        self.dispatch(&folder, task).await;
                    }
                    Ok(None) => break,
                    Err(e) => {
                        tracing::warn!(group = %folder, error = %e, "failed to claim task");
                        break;
                    }
                }
            }
        }
        claimed
    }

    async fn dispatch(&self, folder: &str, claimed: ClaimedTask) {
        let request = match claimed.parse() {
            Ok(request) => request,
            Err(e) => {
                tracing::warn!(group = %folder, file = %claimed.file_name, error = %e, "dropping malformed task");
                if let Some(request_id) = claimed.recover_request_id() {
                    if self.coordinator.ledger().begin(&request_id, Utc::now()).await.is_ok() {
                        let target = recover_target(&claimed.raw);
                        self.coordinator.reject(folder, &request_id, &target, &e).await;
                    }
                }
                return;
            }
        };

        let request_id = request.request_id().to_string();
        if let Err(e) = self.coordinator.ledger().begin(&request_id, Utc::now()).await {
            tracing::warn!(group = %folder, request_id = %request_id, error = %e, "ignoring repeated request");
            return;
        }

        match request {
            TaskRequest::Delegate(task) => {
                if task.source_group != folder {
                    let error = DelegationError::Authorization(format!(
                        "request claims source '{}' but was filed by '{}'",
                        task.source_group, folder
                    ));
                    self.coordinator
                        .reject(folder, &request_id, &task.target_group, &error)
                        .await;
                    return;
                }

                tracing::info!(
                    request_id = %request_id,
                    source = %folder,
                    target = %task.target_group,
                    "delegation request claimed"
                );
                let coordinator = Arc::clone(&self.coordinator);
                let folder = folder.to_string();
                self.tracker.spawn(async move {
                    coordinator.handle_request(&folder, task).await;
                });
            }
        }
    }

    /// 正在执行的委派数
    pub fn in_flight(&self) -> usize {
        self.tracker.len()
    }

    /// 停止接收新委派并等待已派发的跑完，最多等 grace；返回是否全部完成
    pub async fn drain(&self, grace: Duration) -> bool {
        self.tracker.close();
        tokio::time::timeout(grace, self.tracker.wait()).await.is_ok()
    }
}

fn recover_target(raw: &str) -> String {
    serde_json::from_str::<serde_json::Value>(raw)
        .ok()
        .and_then(|v| v.get("targetGroup")?.as_str().map(str::to_string))
        .unwrap_or_default()
}
