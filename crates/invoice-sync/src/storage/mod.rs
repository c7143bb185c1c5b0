//! 本地持久化
//!
//! 同步核心只持久化自己的状态（队列、冲突）；业务实体的存储由应用层的 `LocalStore` 负责。

pub mod kv;

pub use kv::{trees, KvBatch, KvStore};
