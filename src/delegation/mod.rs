//! 跨群委派
//!
//! 一个群的会话把 prompt 交给另一个群的全新会话执行，并同步拿回结果。
//! 授权在占用任何资源之前完成；委派会话只从 DelegationPool 取槽位，满了立即返回 Busy。

mod auth;
mod coordinator;

pub use auth::authorize;
pub use coordinator::{DelegationCoordinator, DelegationSettings, NO_OUTPUT};
