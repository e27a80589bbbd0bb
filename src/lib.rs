pub mod amex;
pub mod config;
pub mod context;
pub mod credentials;
pub mod db;
pub mod dispatch;
pub mod export;
pub mod model;
pub mod processor;
pub mod queue;
pub mod retry;
pub mod validate;
pub mod worker;
