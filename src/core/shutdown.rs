//! 优雅关闭
//!
//! Ctrl+C / SIGTERM 触发后：任务轮询停止认领，在途委派在宽限期内跑完并写回结果，
//! 运行队列丢弃未开始的轮次并等待正在跑的轮次。

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use crate::ipc::TaskWatcher;
use crate::queue::GroupQueue;

/// 关闭信号：一个 CancellationToken 加上最先到达的关闭原因
pub struct ShutdownManager {
    token: CancellationToken,
    reason: Mutex<Option<ShutdownReason>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownReason {
    /// Ctrl+C 或应用自行结束
    UserInitiated,
    /// SIGTERM
    Signal,
    FatalError(String),
}

impl ShutdownManager {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            reason: Mutex::new(None),
        }
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// 触发关闭；重复调用只记录第一次的原因
    pub fn shutdown(&self, reason: ShutdownReason) {
        if let Ok(mut slot) = self.reason.lock() {
            if slot.is_none() {
                tracing::info!(reason = ?reason, "shutdown requested");
                *slot = Some(reason);
            }
        }
        self.token.cancel();
    }

    pub fn reason(&self) -> Option<ShutdownReason> {
        self.reason.lock().ok().and_then(|r| r.clone())
    }

    /// 安装 Ctrl+C / SIGTERM 处理
    pub fn install_signal_handlers(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            if let Ok(()) = tokio::signal::ctrl_c().await {
                manager.shutdown(ShutdownReason::UserInitiated);
            }
        });

        #[cfg(unix)]
        {
            let manager = Arc::clone(self);
            tokio::spawn(async move {
                use tokio::signal::unix::{signal, SignalKind};
                if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
                    sigterm.recv().await;
                    manager.shutdown(ShutdownReason::Signal);
                }
            });
        }
    }
}

impl Default for ShutdownManager {
    fn default() -> Self {
        Self::new()
    }
}

/// 关闭时的一个排空阶段
#[async_trait::async_trait]
pub trait ShutdownCleanup: Send + Sync {
    async fn cleanup(&self) -> anyhow::Result<()>;

    fn name(&self) -> &'static str;
}

/// 按注册顺序执行排空阶段，每个阶段各自受超时约束
pub struct ShutdownCoordinator {
    phases: Vec<Arc<dyn ShutdownCleanup>>,
    timeout: Duration,
}

impl ShutdownCoordinator {
    pub fn new(timeout: Duration) -> Self {
        Self {
            phases: Vec::new(),
            timeout,
        }
    }

    pub fn register<T: ShutdownCleanup + 'static>(&mut self, phase: T) {
        self.phases.push(Arc::new(phase));
    }

    /// 依次排空；某个阶段失败或超时不影响后续阶段。返回全部成功与否
    pub async fn run_cleanup(&self) -> bool {
        let started = Instant::now();
        let mut clean = true;
        for phase in &self.phases {
            let name = phase.name();
            let phase_started = Instant::now();
            match tokio::time::timeout(self.timeout, phase.cleanup()).await {
                Ok(Ok(())) => {
                    tracing::info!(
                        phase = name,
                        elapsed_ms = phase_started.elapsed().as_millis() as u64,
                        "drained"
                    );
                }
                Ok(Err(e)) => {
                    clean = false;
                    tracing::warn!(phase = name, error = %e, "drain incomplete");
                }
                Err(_) => {
                    clean = false;
                    tracing::warn!(
                        phase = name,
                        timeout_secs = self.timeout.as_secs(),
                        "drain timed out"
                    );
                }
            }
        }
        tracing::info!(
            phases = self.phases.len(),
            clean,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "host drained"
        );
        clean
    }
}

/// 任务轮询清理：停止派发新委派，等待在途委派写完结果
pub struct WatcherCleanup {
    watcher: Arc<TaskWatcher>,
    grace: Duration,
}

impl WatcherCleanup {
    pub fn new(watcher: Arc<TaskWatcher>, grace: Duration) -> Self {
        Self { watcher, grace }
    }
}

#[async_trait::async_trait]
impl ShutdownCleanup for WatcherCleanup {
    async fn cleanup(&self) -> anyhow::Result<()> {
        let in_flight = self.watcher.in_flight();
        if in_flight > 0 {
            tracing::info!(
                in_flight,
                grace_secs = self.grace.as_secs(),
                "waiting for in-flight delegations"
            );
        }
        if self.watcher.drain(self.grace).await {
            Ok(())
        } else {
            Err(anyhow::anyhow!(
                "{} delegations still running after {}s",
                self.watcher.in_flight(),
                self.grace.as_secs()
            ))
        }
    }

    fn name(&self) -> &'static str {
        "TaskWatcher"
    }
}

/// 运行队列清理：丢弃未开始的轮次，等待正在跑的轮次结束
pub struct QueueCleanup {
    queue: Arc<GroupQueue>,
}

impl QueueCleanup {
    pub fn new(queue: Arc<GroupQueue>) -> Self {
        Self { queue }
    }
}

#[async_trait::async_trait]
impl ShutdownCleanup for QueueCleanup {
    async fn cleanup(&self) -> anyhow::Result<()> {
        let running = self.queue.pool().active();
        if running > 0 {
            tracing::info!(running, "waiting for running turns, queued turns are dropped");
        }
        self.queue.close();
        self.queue.wait().await;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "GroupQueue"
    }
}

/// 运行宿主直到应用结束或收到关闭信号，然后执行排空
pub async fn run_with_graceful_shutdown<F, Fut>(
    shutdown_manager: Arc<ShutdownManager>,
    app: F,
    cleanup: impl FnOnce() -> Fut,
) where
    F: Future<Output = ()>,
    Fut: Future<Output = ()>,
{
    shutdown_manager.install_signal_handlers();
    let token = shutdown_manager.token();

    tokio::select! {
        _ = app => tracing::info!("host front end finished"),
        _ = token.cancelled() => {}
    }

    cleanup().await;
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::queue::SessionPool;

    #[test]
    fn test_first_reason_wins() {
        let manager = ShutdownManager::new();
        let token = manager.token();
        assert!(manager.reason().is_none());

        manager.shutdown(ShutdownReason::FatalError("stdin broke".into()));
        manager.shutdown(ShutdownReason::Signal);
        assert!(token.is_cancelled());
        assert_eq!(
            manager.reason(),
            Some(ShutdownReason::FatalError("stdin broke".into()))
        );
    }

    /// 记录执行顺序；hang 为 true 时永不结束
    struct Phase {
        name: &'static str,
        order: Arc<Mutex<Vec<&'static str>>>,
        hang: bool,
    }

    #[async_trait::async_trait]
    impl ShutdownCleanup for Phase {
        async fn cleanup(&self) -> anyhow::Result<()> {
            self.order.lock().unwrap().push(self.name);
            if self.hang {
                std::future::pending::<()>().await;
            }
            Ok(())
        }

        fn name(&self) -> &'static str {
            self.name
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_stuck_phase_times_out_and_later_phases_still_run() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut coordinator = ShutdownCoordinator::new(Duration::from_secs(3));
        coordinator.register(Phase {
            name: "watcher",
            order: order.clone(),
            hang: true,
        });
        coordinator.register(Phase {
            name: "queue",
            order: order.clone(),
            hang: false,
        });

        assert!(!coordinator.run_cleanup().await);
        assert_eq!(*order.lock().unwrap(), vec!["watcher", "queue"]);
    }

    #[tokio::test]
    async fn test_app_exit_runs_cleanup_once() {
        let manager = Arc::new(ShutdownManager::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        run_with_graceful_shutdown(manager, async {}, move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_queue_cleanup_waits_for_running_turn() {
        let queue = Arc::new(GroupQueue::new(Arc::new(SessionPool::new(1))));
        let done = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let flag = done.clone();
        queue
            .enqueue_turn(
                "main",
                Box::pin(async move {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    flag.store(true, Ordering::SeqCst);
                }),
            )
            .await;
        while !queue.is_running("main").await || queue.pool().active() == 0 {
            tokio::task::yield_now().await;
        }

        QueueCleanup::new(Arc::clone(&queue)).cleanup().await.unwrap();
        assert!(done.load(Ordering::SeqCst));
    }
}
