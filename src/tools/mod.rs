//! 会话内可用的工具

pub mod delegate;
pub mod registry;

pub use delegate::{DelegateClient, DelegateTool};
pub use registry::{Tool, ToolRegistry};
