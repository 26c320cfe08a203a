// ECR link daemon: runs one payment against a terminal on a serial device or TCP relay.

mod config;
mod transport;

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{bail, Context};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::transport::Outcome;

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Payment workflow did not complete.
const EXIT_WORKFLOW_FAILED: u8 = 1;
/// Configuration or channel error.
const EXIT_FATAL: u8 = 2;

struct Args {
    version: bool,
    config: Option<PathBuf>,
}

fn parse_args<I: Iterator<Item = String>>(mut args: I) -> anyhow::Result<Args> {
    let mut out = Args {
        version: false,
        config: None,
    };
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--version" | "-V" => out.version = true,
            "--config" => {
                let path = args.next().context("--config needs a path")?;
                out.config = Some(PathBuf::from(path));
            }
            other => bail!("unknown argument: {}", other),
        }
    }
    Ok(out)
}

fn main() -> ExitCode {
    let args = match parse_args(std::env::args().skip(1)) {
        Ok(a) => a,
        Err(e) => {
            eprintln!("ecr-linux: {}", e);
            return ExitCode::from(EXIT_FATAL);
        }
    };
    if args.version {
        println!("ecr-linux {}", VERSION);
        return ExitCode::SUCCESS;
    }

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    match run(&args) {
        Ok(Outcome::Completed(receipt)) => {
            println!("{}", receipt.text);
            ExitCode::SUCCESS
        }
        Ok(Outcome::Failed(e)) => {
            error!(error = %e, "Payment failed");
            ExitCode::from(EXIT_WORKFLOW_FAILED)
        }
        Ok(Outcome::Interrupted) => ExitCode::from(EXIT_WORKFLOW_FAILED),
        Err(e) => {
            error!(error = format_args!("{:#}", e), "Fatal error");
            ExitCode::from(EXIT_FATAL)
        }
    }
}

fn run(args: &Args) -> anyhow::Result<Outcome> {
    let cfg = config::load(args.config.as_deref())?;
    info!(
        amount = cfg.amount,
        currency = cfg.currency,
        relay = cfg.relay.as_deref().unwrap_or("-"),
        device = %cfg.device,
        "Starting payment"
    );

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    rt.block_on(async {
        let mut channel = transport::open(&cfg).await?;
        let mut core = ecr_core::EcrCore::with_config(cfg.session());
        let outcome = transport::run_session(&mut channel, &mut core, shutdown_signal()).await;
        let stats = core.stats();
        info!(
            transmitted = stats.transmitted,
            retransmitted = stats.retransmitted,
            acknowledged = stats.acknowledged,
            dropped = stats.dropped,
            "Link statistics"
        );
        outcome
    })
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> anyhow::Result<Args> {
        parse_args(list.iter().map(|s| s.to_string()))
    }

    #[test]
    fn parses_flags() {
        assert!(args(&["-V"]).unwrap().version);
        let a = args(&["--config", "/tmp/ecr.toml"]).unwrap();
        assert_eq!(a.config, Some(PathBuf::from("/tmp/ecr.toml")));
        assert!(!a.version);
    }

    #[test]
    fn rejects_bad_arguments() {
        assert!(args(&["--config"]).is_err());
        assert!(args(&["--relay"]).is_err());
    }
}
