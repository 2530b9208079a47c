//! 代理流量账本模块
//!
//! 消费引擎的结构化事件流，按关联键将乱序/分片到达的事件重建为
//! 完整事务记录，提供有界存储与查询接口

pub mod decoder;
pub mod model;
pub mod store;
mod handlers;
mod router;
mod types;

pub use router::create_traffic_router;
pub use store::TrafficMonitor;
