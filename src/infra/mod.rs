//! 基础设施模块
//!
//! 封装外部依赖（命令执行、文件锁）

pub mod command;
pub mod lock;

pub use command::{CommandError, CommandRunner};
pub use lock::{DeployLock, LockError};
