pub mod agent;
pub mod config;
pub mod metric;
pub mod models;
pub mod plugin;
pub mod serialize;
pub mod supervisor;
