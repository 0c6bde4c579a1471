pub mod cron;
#[cfg(unix)]
pub mod shutdown;
