pub mod api;
pub mod config;
pub mod content;
pub mod db;
pub mod handlers;
pub mod tasks;
pub mod telemetry;
