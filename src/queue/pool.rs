//! 并发池
//!
//! 计数只通过 Semaphore 许可变化，许可随 PoolPermit drop 归还，
//! 因此每次成功 acquire 恰好对应一次 release，错误路径也不例外。

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};

use crate::core::DelegationError;

/// 池中一个槽位；drop 即释放
#[derive(Debug)]
pub struct PoolPermit {
    _permit: OwnedSemaphorePermit,
    pool: &'static str,
}

impl Drop for PoolPermit {
    fn drop(&mut self) {
        tracing::debug!(pool = self.pool, "slot released");
    }
}

#[derive(Debug)]
struct Slots {
    semaphore: Arc<Semaphore>,
    max: usize,
    name: &'static str,
}

impl Slots {
    fn new(name: &'static str, max: usize) -> Self {
        let max = max.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(max)),
            max,
            name,
        }
    }

    fn active(&self) -> usize {
        self.max.saturating_sub(self.semaphore.available_permits())
    }

    fn permit(&self, permit: OwnedSemaphorePermit) -> PoolPermit {
        tracing::debug!(pool = self.name, active = self.active(), max = self.max, "slot acquired");
        PoolPermit {
            _permit: permit,
            pool: self.name,
        }
    }
}

/// 全局会话池：acquire 异步等待空位，等待者按 FIFO 唤醒
#[derive(Debug)]
pub struct SessionPool {
    slots: Slots,
}

impl SessionPool {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            slots: Slots::new("sessions", max_concurrent),
        }
    }

    /// 等待一个空位；池已关闭（宿主退出中）时返回 None
    pub async fn acquire(&self) -> Option<PoolPermit> {
        let permit = self.slots.semaphore.clone().acquire_owned().await.ok()?;
        Some(self.slots.permit(permit))
    }

    pub fn active(&self) -> usize {
        self.slots.active()
    }

    /// 关闭后所有等待者立即得到 None，已发出的许可不受影响
    pub fn close(&self) {
        self.slots.semaphore.close();
    }
}

/// 委派池：只提供 try_acquire，满了立刻返回 Busy，从不排队
#[derive(Debug)]
pub struct DelegationPool {
    slots: Slots,
}

impl DelegationPool {
    pub fn new(max_containers: usize) -> Self {
        Self {
            slots: Slots::new("delegation", max_containers),
        }
    }

    pub fn try_acquire(&self) -> Result<PoolPermit, DelegationError> {
        match self.slots.semaphore.clone().try_acquire_owned() {
            Ok(permit) => Ok(self.slots.permit(permit)),
            Err(TryAcquireError::NoPermits) | Err(TryAcquireError::Closed) => {
                Err(DelegationError::Busy {
                    active: self.slots.active(),
                    max: self.slots.max,
                })
            }
        }
    }

    pub fn active(&self) -> usize {
        self.slots.active()
    }
}
