//! 运行时状态模块
//!
//! 管理应用状态和部署记录

pub mod app_state;
pub mod attempt_store;

pub use app_state::AppState;
pub use attempt_store::AttemptStore;
