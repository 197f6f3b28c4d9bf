pub mod types;
pub mod config;
pub mod utils;
pub mod mqtt;
pub mod repository;
pub mod memory;

// 重新导出常用类型
pub use types::*;
pub use self::config::*;
pub use utils::*;
pub use mqtt::*;
pub use repository::*;
