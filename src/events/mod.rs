//! 事件模块
//!
//! - `types.rs`: 会话事件类型
//! - `bus.rs`: 事件总线（大小写不敏感、可否决、通配通道）

mod bus;
mod types;

pub use bus::*;
pub use types::*;
