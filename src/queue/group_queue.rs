//! 按群串行的运行队列
//!
//! 同一个群任意时刻最多一个轮次在跑（会话状态不支持并发修改），轮次按提交顺序执行；
//! 不同群之间并行，总数受 SessionPool 限制。委派会话不经过这里。

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use futures_util::future::BoxFuture;
use tokio::sync::Mutex;
use tokio_util::task::TaskTracker;

use super::pool::SessionPool;

/// 一个对话轮次
pub type Turn = BoxFuture<'static, ()>;

#[derive(Default)]
struct GroupState {
    pending: VecDeque<Turn>,
    running: bool,
}

/// 运行队列：每个群一个 FIFO + 一个串行消费者
pub struct GroupQueue {
    pool: Arc<SessionPool>,
    groups: Arc<Mutex<HashMap<String, GroupState>>>,
    tracker: TaskTracker,
}

impl GroupQueue {
    pub fn new(pool: Arc<SessionPool>) -> Self {
        Self {
            pool,
            groups: Arc::new(Mutex::new(HashMap::new())),
            tracker: TaskTracker::new(),
        }
    }

    pub fn pool(&self) -> &Arc<SessionPool> {
        &self.pool
    }

    /// 追加轮次；该群空闲时立即启动消费者，否则排在已有轮次之后
    pub async fn enqueue_turn(&self, folder: &str, turn: Turn) {
        let start_drain = {
            let mut groups = self.groups.lock().await;
            let state = groups.entry(folder.to_string()).or_default();
            state.pending.push_back(turn);
            if state.running {
                false
            } else {
                state.running = true;
                true
            }
        };

        if start_drain {
            let groups = Arc::clone(&self.groups);
            let pool = Arc::clone(&self.pool);
            let folder = folder.to_string();
            self.tracker.spawn(drain(groups, pool, folder));
        } else {
            tracing::debug!(folder = %folder, "turn queued behind running turn");
        }
    }

    /// 该群尚未开始的轮次数
    pub async fn pending(&self, folder: &str) -> usize {
        self.groups
            .lock()
            .await
            .get(folder)
            .map(|s| s.pending.len())
            .unwrap_or(0)
    }

    pub async fn is_running(&self, folder: &str) -> bool {
        self.groups
            .lock()
            .await
            .get(folder)
            .map(|s| s.running)
            .unwrap_or(false)
    }

    /// 所有群都没有在跑或排队的轮次
    pub async fn is_idle(&self) -> bool {
        self.groups.lock().await.is_empty()
    }

    /// 停止接收：关闭会话池，未开始的轮次被丢弃，正在跑的轮次继续
    pub fn close(&self) {
        self.pool.close();
        self.tracker.close();
    }

    /// 等待所有消费者退出（需先 close）
    pub async fn wait(&self) {
        self.tracker.wait().await;
    }
}

async fn drain(
    groups: Arc<Mutex<HashMap<String, GroupState>>>,
    pool: Arc<SessionPool>,
    folder: String,
) {
    loop {
        let turn = {
            let mut guard = groups.lock().await;
            let Some(state) = guard.get_mut(&folder) else {
                return;
            };
            match state.pending.pop_front() {
                Some(turn) => turn,
                None => {
                    guard.remove(&folder);
                    return;
                }
            }
        };

        let Some(permit) = pool.acquire().await else {
            let mut guard = groups.lock().await;
            let dropped = guard.remove(&folder).map(|s| s.pending.len()).unwrap_or(0) + 1;
            tracing::warn!(folder = %folder, dropped, "session pool closed, dropping queued turns");
            return;
        };

        // 单独 spawn，轮次 panic 不会卡死这个群的队列
        if let Err(e) = tokio::spawn(turn).await {
            tracing::error!(folder = %folder, error = %e, "turn panicked");
        }
        drop(permit);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    use super::*;

    fn recording_turn(log: Arc<StdMutex<Vec<String>>>, label: &str, ms: u64) -> Turn {
        let label = label.to_string();
        Box::pin(async move {
            log.lock().unwrap().push(format!("start {label}"));
            tokio::time::sleep(Duration::from_millis(ms)).await;
            log.lock().unwrap().push(format!("end {label}"));
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_turns_for_one_group_run_in_order_without_overlap() {
        let queue = GroupQueue::new(Arc::new(SessionPool::new(4)));
        let log = Arc::new(StdMutex::new(Vec::new()));

        queue.enqueue_turn("main", recording_turn(log.clone(), "1", 30)).await;
        queue.enqueue_turn("main", recording_turn(log.clone(), "2", 10)).await;
        queue.enqueue_turn("main", recording_turn(log.clone(), "3", 5)).await;
        assert!(queue.is_running("main").await);

        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(
            *log.lock().unwrap(),
            vec!["start 1", "end 1", "start 2", "end 2", "start 3", "end 3"]
        );
        assert!(!queue.is_running("main").await);
        assert_eq!(queue.pending("main").await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_global_cap_bounds_parallel_groups() {
        let queue = GroupQueue::new(Arc::new(SessionPool::new(2)));
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let done = Arc::new(AtomicUsize::new(0));

        for folder in ["a", "b", "c", "d", "e"] {
            let current = Arc::clone(&current);
            let peak = Arc::clone(&peak);
            let done = Arc::clone(&done);
            queue
                .enqueue_turn(
                    folder,
                    Box::pin(async move {
                        let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        current.fetch_sub(1, Ordering::SeqCst);
                        done.fetch_add(1, Ordering::SeqCst);
                    }),
                )
                .await;
        }

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(done.load(Ordering::SeqCst), 5);
        assert_eq!(peak.load(Ordering::SeqCst), 2);
        assert_eq!(queue.pool().active(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_turn_does_not_block_group() {
        let queue = GroupQueue::new(Arc::new(SessionPool::new(1)));
        let log = Arc::new(StdMutex::new(Vec::new()));

        queue
            .enqueue_turn("main", Box::pin(async { panic!("boom") }))
            .await;
        queue.enqueue_turn("main", recording_turn(log.clone(), "after", 1)).await;

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(*log.lock().unwrap(), vec!["start after", "end after"]);
        assert_eq!(queue.pool().active(), 0);
    }
}
