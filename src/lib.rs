pub mod classifier;
pub mod config;
pub mod db;
pub mod gmail;
pub mod identity;
pub mod model;
pub mod processor;
pub mod queue;
pub mod server;
pub mod sms;
pub mod tasks;
pub mod watch;
