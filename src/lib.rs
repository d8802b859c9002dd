pub mod auth;
pub mod club;
pub mod config;
pub mod engine;
pub mod limits;
pub mod model;
pub mod observability;
pub mod sql;
pub mod sweep;
pub mod tls;
pub mod wal;
pub mod wire;
