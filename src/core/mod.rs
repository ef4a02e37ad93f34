//! 核心：错误类型、宿主装配与优雅关闭

pub mod builder;
pub mod error;
pub mod shutdown;

pub use builder::{Host, HostBuilder};
pub use error::{DelegationError, HiveError};
pub use shutdown::{
    run_with_graceful_shutdown, QueueCleanup, ShutdownCleanup, ShutdownCoordinator,
    ShutdownManager, ShutdownReason, WatcherCleanup,
};
