//! 群组：注册表、容器策略、会话 ID 存储
//!
//! 一个 RegisteredGroup 对应一个被托管的对话；`folder` 是它在文件系统上的命名空间
//! （groups/<folder> 工作区、ipc/<folder> 任务与结果目录），全局唯一。

mod registry;
mod sessions;

pub use registry::{validate_folder, AdditionalMount, ContainerConfig, GroupRegistry, RegisteredGroup};
pub use sessions::SessionStore;
