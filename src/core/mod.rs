//! Core of factflow: the signed fact model, the fact log, the broker, the
//! view projector and the plumbing they share.

pub mod bridge;
pub mod broker;
pub mod config;
pub mod context;
pub mod db;
pub mod error;
pub mod fact;
pub mod fact_log;
pub mod factory;
pub mod logging;
pub mod output;
pub mod pool;
pub mod projector;
pub mod schemas;
pub mod store;
pub mod time;
