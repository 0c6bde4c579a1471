//! The t svc demo programs as a library: a signal-driven shutdown hook, a cron
//! ticker and a self-signed certificate generator.

pub mod behaviour;
pub mod function;
pub mod tasker;

#[cfg(unix)]
pub use tasker::shutdown::ShutdownHook;
