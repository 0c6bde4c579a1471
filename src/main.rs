use std::error::Error;
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use nix::sys::signal::Signal;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use tsvc::behaviour::certificate::{self, CertificateProfile};
use tsvc::function::{executable_dir, parse_signal};
use tsvc::tasker::cron::Scheduler;
use tsvc::tasker::shutdown::{callback, ShutdownHook};

#[cfg(not(unix))]
compile_error!("tsvc waits on unix signals and only builds for unix targets");

#[macro_export]
macro_rules! fatal {
    ($($tt: tt)*) => {
        use std::io::Write;
        let _ = writeln!(&mut ::std::io::stderr(), $($tt)*);
        ::std::process::exit(1);
    };
}

#[derive(Parser)]
#[command(name = "tsvc", version, about = "t svc demo programs")]
struct Cli {
    /// Log filter used when RUST_LOG is not set
    #[arg(long, global = true, default_value = "tsvc=info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Wait for a termination signal, then clean up (default)
    Serve(ServeArgs),
    /// Print the time on a cron schedule
    Cron {
        /// Cron expression with a leading seconds field
        #[arg(short, long, default_value = "*/1 * * * * *")]
        expr: String,
        /// Stop after this many seconds instead of waiting for a signal
        #[arg(long)]
        for_secs: Option<u64>,
    },
    /// Generate a self-signed certificate and print its fields
    Cert {
        /// Output directory, defaults to the executable's directory
        #[arg(short, long)]
        out_dir: Option<PathBuf>,
        /// Validity period in days
        #[arg(long, default_value_t = 365)]
        days: u32,
    },
}

#[derive(Args, Default)]
struct ServeArgs {
    /// Signal to wait for, e.g. HUP or SIGQUIT (repeatable, default INT and TERM)
    #[arg(short, long = "signal", value_parser = parse_signal)]
    signals: Vec<Signal>,
}

fn main() {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| cli.log_level.as_str().into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let command = cli
        .command
        .unwrap_or_else(|| Commands::Serve(ServeArgs::default()));
    let result = match command {
        Commands::Serve(args) => serve(args),
        Commands::Cron { expr, for_secs } => cron(&expr, for_secs),
        Commands::Cert { out_dir, days } => cert(out_dir, days),
    };

    if let Err(e) = result {
        fatal!("{}", e);
    }
}

fn serve(args: ServeArgs) -> Result<(), Box<dyn Error>> {
    println!("t svc main endpoint");

    let signal = shutdown_hook(args.signals).close([callback(|| {
        println!("do something before shutdown");
        Ok(())
    })])?;

    info!(%signal, "shutdown complete");
    Ok(())
}

/// The default hook unless signals were given on the command line.
fn shutdown_hook(signals: Vec<Signal>) -> ShutdownHook {
    if signals.is_empty() {
        ShutdownHook::new()
    } else {
        ShutdownHook::new().with_signals(signals)
    }
}

fn cron(expr: &str, for_secs: Option<u64>) -> Result<(), Box<dyn Error>> {
    let mut scheduler = Scheduler::new();
    let id = scheduler.add_job(expr, |at| {
        println!("cron task fired: {}", at.format("%Y-%m-%d %H:%M:%S"));
    })?;
    println!("cron job added, id: {}", id);

    let running = scheduler.start();
    match for_secs {
        Some(secs) => {
            thread::sleep(Duration::from_secs(secs));
            running.stop();
        }
        None => {
            ShutdownHook::new().close([callback(move || {
                running.stop();
                Ok(())
            })])?;
        }
    }
    Ok(())
}

fn cert(out_dir: Option<PathBuf>, days: u32) -> Result<(), Box<dyn Error>> {
    let dir = match out_dir {
        Some(dir) => dir,
        None => executable_dir()?,
    };
    println!("Output dir: {}", dir.display());

    let profile = CertificateProfile {
        valid_days: days,
        ..CertificateProfile::default()
    };
    let paths = certificate::generate(&profile)?.write_to(&dir)?;

    println!("Self-signed certificate generated:");
    println!("Certificate file: {}", paths.cert.display());
    println!("Private key file: {}", paths.key.display());

    let report = certificate::inspect_file(&paths.cert, Utc::now())?;
    println!("\n{}", report);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tsvc::tasker::shutdown::SignalSet;

    #[test]
    fn serve_without_flags_uses_default_signals() {
        let hook = shutdown_hook(Vec::new());
        assert_eq!(hook.signals(), &SignalSet::default());
    }

    #[test]
    fn serve_flags_replace_default_signals() {
        let cli = Cli::try_parse_from(["tsvc", "serve", "-s", "HUP", "--signal", "quit"]).unwrap();
        let Some(Commands::Serve(args)) = cli.command else {
            panic!("expected serve subcommand");
        };
        let hook = shutdown_hook(args.signals);
        let expected: SignalSet = [Signal::SIGHUP, Signal::SIGQUIT].into_iter().collect();
        assert_eq!(hook.signals(), &expected);
    }

    #[test]
    fn no_subcommand_parses() {
        let cli = Cli::try_parse_from(["tsvc"]).unwrap();
        assert!(cli.command.is_none());
        assert_eq!(cli.log_level, "tsvc=info");
    }
}
