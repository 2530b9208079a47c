//! 应用数据模型

pub mod config;
