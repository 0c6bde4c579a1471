use std::env;
use std::error::Error;
use std::path::PathBuf;
#[cfg(unix)]
use std::str::FromStr;

#[cfg(unix)]
use nix::sys::signal::Signal;

/// Directory containing the running executable.
pub fn executable_dir() -> Result<PathBuf, Box<dyn Error>> {
    let exe = env::current_exe()?;
    match exe.parent() {
        Some(dir) => Ok(dir.to_path_buf()),
        None => Err(format!("Executable {} has no parent directory", exe.display()).into()),
    }
}

/// Parses `HUP`, `sighup`, `SIGHUP` or `1` into a signal.
#[cfg(unix)]
pub fn parse_signal(name: &str) -> Result<Signal, String> {
    let name = name.trim();
    if let Ok(number) = name.parse::<i32>() {
        return Signal::try_from(number).map_err(|_| format!("Unknown signal number {}", number));
    }

    let mut upper = name.to_ascii_uppercase();
    if !upper.starts_with("SIG") {
        upper.insert_str(0, "SIG");
    }
    Signal::from_str(&upper).map_err(|_| format!("Unknown signal {}", name))
}
