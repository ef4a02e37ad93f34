//! 内置渠道
//!
//! 真正的聊天平台适配器不在本 crate 内；这里只提供让宿主在本地可用的控制台渠道。

mod console;

pub use console::ConsoleChannel;
