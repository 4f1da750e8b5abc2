//! DVR Installer - Terminal front-end
//!
//! Usage:
//!   dvr-installer [FILE]              Install from a DaVinci Resolve .run archive
//!   dvr-installer FILE --show-log     Also print the full build log at the end
//!   dvr-installer FILE --json         Emit the install report as JSON
//!
//! Walks the same flow as the settings panel: pick a file, authenticate,
//! follow the build log, then show a success or failure banner.

use anyhow::{Context, Result};
use clap::Parser;
use dialoguer::{Input, Password};
use indicatif::{ProgressBar, ProgressStyle};
use std::io::{BufRead, Write};
use std::path::PathBuf;
use tokio::signal::unix::{signal, Signal, SignalKind};
use tokio::sync::oneshot;
use tokio_stream::wrappers::WatchStream;
use tokio_stream::StreamExt;
use tracing_subscriber::{EnvFilter, FmtSubscriber};
use zeroize::Zeroizing;

use dvr_installer::config::InstallerConfig;
use dvr_installer::credentials::AuthError;
use dvr_installer::flow::{FlowError, FlowState, InstallFlow, InstallReport};
use dvr_installer::runner::OutputLog;

const PASSWORD_ATTEMPTS: usize = 3;

#[derive(Parser, Debug)]
#[command(name = "dvr-installer")]
#[command(about = "Build and install DaVinci Resolve from its .run archive")]
#[command(version)]
struct Args {
    /// Path to DaVinci_Resolve[_Studio]_<version>_Linux.run (prompted if omitted)
    file: Option<PathBuf>,

    /// Configuration file (default: ~/.config/dvr-installer/config.toml)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Read the sudo password from the first line of stdin
    #[arg(long)]
    password_stdin: bool,

    /// Print the full build log after the installation
    #[arg(long)]
    show_log: bool,

    /// Print the install report as JSON instead of banners
    #[arg(long)]
    json: bool,

    /// Verbose output
    #[arg(short, long, conflicts_with = "quiet")]
    verbose: bool,

    /// Only print errors and the final result
    #[arg(short, long)]
    quiet: bool,
}

// Console helper for output control
struct Console {
    quiet: bool,
}

impl Console {
    fn log(&self, msg: impl std::fmt::Display) {
        if !self.quiet {
            println!("{}", msg);
        }
    }

    fn success(&self, msg: impl std::fmt::Display) {
        println!("✅ {}", msg);
    }

    fn warn(&self, msg: impl std::fmt::Display) {
        if !self.quiet {
            eprintln!("⚠️  {}", msg);
        }
    }

    fn error(&self, msg: impl std::fmt::Display) {
        eprintln!("❌ {}", msg); // Always print errors
    }

    fn spinner(&self, msg: &str) -> Option<ProgressBar> {
        if self.quiet {
            return None;
        }
        let pb = ProgressBar::new_spinner();
        if let Ok(style) = ProgressStyle::with_template("{spinner:.green} [{elapsed_precise}] {msg}") {
            pb.set_style(style);
        }
        pb.set_message(msg.to_string());
        pb.enable_steady_tick(std::time::Duration::from_millis(100));
        Some(pb)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let level = if args.verbose {
        "debug"
    } else if args.quiet || args.json {
        "warn"
    } else {
        "info"
    };
    let _ = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .with_target(false)
        .without_time()
        .with_writer(std::io::stderr)
        .try_init();

    let console = Console {
        quiet: args.quiet || args.json,
    };

    let config = InstallerConfig::load(args.config.as_deref())?;
    let mut flow = InstallFlow::new(config).context("Invalid installer configuration")?;

    flow.start()?;
    let file = match args.file.clone() {
        Some(file) => file,
        None => prompt_for_file()?,
    };
    let file = if file.is_absolute() {
        file
    } else {
        std::env::current_dir()
            .context("Failed to resolve the current directory")?
            .join(file)
    };

    if flow.select_file(&file)? == FlowState::AwaitingCredential {
        authenticate(&mut flow, &args, &console).await?;
    }

    let product = flow
        .request()
        .map(|r| r.product_name().to_string())
        .unwrap_or_default();
    console.log(format!("Installing {}...", product));

    let report = run_install(&mut flow, &args, &console).await?;
    print_report(&report, &args, &console)?;

    if !report.succeeded {
        std::process::exit(1);
    }
    Ok(())
}

fn prompt_for_file() -> Result<PathBuf> {
    let path: String = Input::new()
        .with_prompt("DaVinci Resolve .run installer")
        .interact_text()
        .context("Failed to read the installer path")?;
    Ok(PathBuf::from(path.trim()))
}

/// Prompt until the password is accepted; the chosen file is kept between tries
async fn authenticate(flow: &mut InstallFlow, args: &Args, console: &Console) -> Result<()> {
    let attempts = if args.password_stdin { 1 } else { PASSWORD_ATTEMPTS };

    for attempt in 1..=attempts {
        let password = if args.password_stdin {
            read_password_line()?
        } else {
            Zeroizing::new(
                Password::new()
                    .with_prompt("Password for sudo")
                    .allow_empty_password(true)
                    .interact()
                    .context("Failed to read password")?,
            )
        };

        match flow.submit_password(password).await {
            Ok(()) => return Ok(()),
            Err(FlowError::Auth(e @ (AuthError::Rejected | AuthError::EmptyPassword))) => {
                console.error(&e);
                if attempt < attempts {
                    console.log(format!("Please try again ({}/{})", attempt + 1, attempts));
                }
            }
            Err(e) => {
                flow.cancel()?;
                return Err(e.into());
            }
        }
    }

    flow.cancel()?;
    anyhow::bail!("Authentication failed");
}

fn read_password_line() -> Result<Zeroizing<String>> {
    let mut line = Zeroizing::new(String::new());
    std::io::stdin()
        .lock()
        .read_line(&mut line)
        .context("Failed to read password from stdin")?;

    let trimmed = line.trim_end_matches(['\n', '\r']).len();
    line.truncate(trimmed);
    Ok(line)
}

async fn run_install(flow: &mut InstallFlow, args: &Args, console: &Console) -> Result<InstallReport> {
    let spinner = console.spinner("Preparing build directory...");

    // spinner message tracks the flow state
    let state_task = spinner.clone().map(|pb| {
        let mut states = WatchStream::new(flow.subscribe());
        tokio::spawn(async move {
            while let Some(state) = states.next().await {
                if let Some(msg) = state_message(state) {
                    pb.set_message(msg);
                }
            }
        })
    });

    let (done_tx, done_rx) = oneshot::channel();
    let mut follower = None;
    let stream_log = !args.quiet && !args.json;

    // from here on a signal must not skip rollback and session cleanup
    let mut signals = ShutdownSignals::register()?;
    let result = {
        let run = flow.run_with(|log| {
            if stream_log {
                follower = Some(tokio::spawn(follow_log(log.clone(), done_rx, spinner.clone())));
            }
        });
        tokio::pin!(run);

        loop {
            tokio::select! {
                result = &mut run => break result,
                name = signals.recv() => {
                    console.warn(format!(
                        "Received {}: waiting for the build to stop, then cleaning up",
                        name
                    ));
                    if name == "SIGTERM" {
                        signals.forward_terminate();
                    }
                }
            }
        }
    };

    let _ = done_tx.send(());
    if let Some(follower) = follower {
        if let Err(e) = follower.await {
            tracing::debug!("Log follower stopped: {}", e);
        }
    }
    if let Some(task) = state_task {
        task.abort();
    }
    if let Some(pb) = spinner {
        pb.finish_and_clear();
    }

    Ok(result?)
}

/// SIGINT/SIGTERM listeners held while an attempt runs, so the process stays
/// alive until the build stops and the attempt has been rolled back
struct ShutdownSignals {
    interrupt: Signal,
    terminate: Signal,
    forwarded: bool,
}

impl ShutdownSignals {
    fn register() -> Result<Self> {
        Ok(Self {
            interrupt: signal(SignalKind::interrupt()).context("Failed to handle SIGINT")?,
            terminate: signal(SignalKind::terminate()).context("Failed to handle SIGTERM")?,
            forwarded: false,
        })
    }

    /// Wait for the next signal and return its name
    async fn recv(&mut self) -> &'static str {
        tokio::select! {
            Some(()) = self.interrupt.recv() => "SIGINT",
            Some(()) = self.terminate.recv() => "SIGTERM",
            else => std::future::pending().await,
        }
    }

    /// Pass SIGTERM on to the build, which shares our process group.
    /// Ctrl-C already reaches the whole group from the terminal.
    fn forward_terminate(&mut self) {
        if self.forwarded {
            return;
        }
        self.forwarded = true;

        // SAFETY: kill(2) with pid 0 only signals our own process group
        if unsafe { libc::kill(0, libc::SIGTERM) } != 0 {
            tracing::warn!(
                "Failed to forward SIGTERM: {}",
                std::io::Error::last_os_error()
            );
        }
    }
}

fn state_message(state: FlowState) -> Option<&'static str> {
    match state {
        FlowState::Staging => Some("Preparing build directory..."),
        FlowState::Installing => Some("Building and installing..."),
        FlowState::Finalizing => Some("Pinning installed packages..."),
        FlowState::Succeeded | FlowState::Failed => Some("Cleaning up..."),
        _ => None,
    }
}

/// Print new log output as it arrives until `done` fires
async fn follow_log(log: OutputLog, mut done: oneshot::Receiver<()>, spinner: Option<ProgressBar>) {
    let mut updates = WatchStream::new(log.subscribe());
    let mut offset = 0;

    loop {
        let finished = tokio::select! {
            update = updates.next() => update.is_none(),
            _ = &mut done => true,
        };

        let chunk = log.since(offset);
        offset += chunk.len();
        if !chunk.is_empty() {
            let print = || {
                let mut stdout = std::io::stdout().lock();
                let _ = stdout.write_all(chunk.as_bytes());
                let _ = stdout.flush();
            };
            match &spinner {
                Some(pb) => pb.suspend(print),
                None => print(),
            }
        }

        if finished {
            break;
        }
    }
}

fn print_report(report: &InstallReport, args: &Args, console: &Console) -> Result<()> {
    if args.json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }

    for warning in &report.warnings {
        console.warn(warning);
    }

    if args.show_log {
        println!("----- build log -----");
        print!("{}", report.log);
        if !report.log.ends_with('\n') {
            println!();
        }
        println!("---------------------");
    }

    if report.succeeded {
        console.success(report.banner());
    } else {
        console.error(report.banner());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_interrupt_is_caught_instead_of_terminating() {
        let mut signals = ShutdownSignals::register().unwrap();

        // SAFETY: signals this test process, which now handles SIGINT
        assert_eq!(unsafe { libc::kill(libc::getpid(), libc::SIGINT) }, 0);

        assert_eq!(signals.recv().await, "SIGINT");
    }

    #[test]
    fn test_state_messages() {
        assert_eq!(state_message(FlowState::Idle), None);
        assert_eq!(
            state_message(FlowState::Installing),
            Some("Building and installing...")
        );
    }
}
