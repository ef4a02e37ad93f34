//! Hive - 隔离 agent 会话的宿主编排器
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误类型、宿主装配、优雅关闭
//! - **groups**: 注册群与会话 ID 持久化
//! - **queue**: 会话池 / 委派池与按群串行的运行队列
//! - **ipc**: 基于文件投递的任务与结果通道、请求状态机、任务轮询
//! - **delegation**: 跨群委派的授权与执行
//! - **runner**: 会话运行器（容器进程）
//! - **router** / **channels**: 入站消息路由与内置控制台渠道
//! - **tools**: 会话内工具（delegate）

pub mod channels;
pub mod config;
pub mod core;
pub mod delegation;
pub mod groups;
pub mod ipc;
pub mod observability;
pub mod queue;
pub mod router;
pub mod runner;
pub mod tools;

pub use crate::core::{DelegationError, HiveError, Host, HostBuilder};
