pub mod config;
pub mod dispatch;
pub mod error;
pub mod invoker;
pub mod jetstream;
pub mod membership;
pub mod scheduler;
pub mod worker;
