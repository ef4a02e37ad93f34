//! 调度：全局会话池、委派池、按群串行的运行队列
//!
//! 两个池互不相交：普通对话轮次只占 SessionPool，委派会话只占 DelegationPool。

mod group_queue;
mod pool;

pub use group_queue::{GroupQueue, Turn};
pub use pool::{DelegationPool, PoolPermit, SessionPool};
