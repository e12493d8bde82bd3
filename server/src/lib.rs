pub mod app_config;
pub mod db;
pub mod pg_notify;
pub mod rpc;
