//! # TeleDerm Database
//!
//! 持久化层：统一存储接口、内存实现与PostgreSQL实现。
//! 预约/结算/取消/病历写入的临界区都收敛为存储层的单个原子操作，
//! 保证不会有锁跨越外部调用。

pub mod connection;
pub mod memory;
pub mod postgres;
pub mod schema;
pub mod store;

pub use connection::DatabasePool;
pub use memory::MemoryStore;
pub use postgres::PostgresStore;
pub use store::*;
