//! Steppe coordinator node executable.

use std::net::SocketAddr;
use std::process::ExitCode;

use clap::Parser;

use env_logger::Env;

use steppe::{pf_error, Coordinator, SteppeError};

use tokio::runtime::Builder;
use tokio::sync::watch;

/// Command line arguments definition.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct CliArgs {
    /// Client-facing API address to listen on.
    #[arg(short, long, default_value = "127.0.0.1:52700")]
    client_addr: SocketAddr,

    /// Worker-facing API address to listen on.
    #[arg(short, long, default_value = "127.0.0.1:52710")]
    worker_addr: SocketAddr,

    /// Number of tokio worker threads.
    #[arg(long, default_value_t = 2)]
    threads: usize,

    /// Configuration string in TOML format (e.g. 'max_steps = 20').
    #[arg(long)]
    config: Option<String>,
}

impl CliArgs {
    /// Sanitize command line arguments, returning `Ok(())` on success or
    /// `Err(SteppeError)` on any error.
    fn sanitize(&self) -> Result<(), SteppeError> {
        if self.client_addr.port() <= 1024 {
            Err(SteppeError(format!(
                "invalid client_addr port {}",
                self.client_addr.port()
            )))
        } else if self.worker_addr.port() <= 1024 {
            Err(SteppeError(format!(
                "invalid worker_addr port {}",
                self.worker_addr.port()
            )))
        } else if self.client_addr == self.worker_addr {
            Err(SteppeError(format!(
                "client_addr == worker_addr '{}'",
                self.client_addr
            )))
        } else if self.threads < 2 {
            Err(SteppeError(format!(
                "invalid number of threads {}",
                self.threads
            )))
        } else {
            Ok(())
        }
    }
}

// Coordinator executable main entrance.
fn coord_main() -> Result<(), SteppeError> {
    // read in and parse command line arguments
    let args = CliArgs::parse();
    args.sanitize()?;

    // create tokio multi-threaded runtime
    let runtime = Builder::new_multi_thread()
        .enable_all()
        .worker_threads(args.threads)
        .thread_name("tokio-worker-coord")
        .build()?;

    // enter tokio runtime, setup the coordinator, and start the main event
    // loop logic
    runtime.block_on(async move {
        let mut coord = Coordinator::new_and_setup(
            args.worker_addr,
            args.client_addr,
            args.config.as_deref(),
        )
        .await?;

        // termination signal directs the event loop to exit cleanly
        let (tx_term, rx_term) = watch::channel(false);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                let _ = tx_term.send(true);
            }
        });

        coord.run(rx_term).await?;
        Ok::<(), SteppeError>(())
    })?;

    Ok(())
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(Env::default().default_filter_or("info"))
        .init();

    if let Err(e) = coord_main() {
        pf_error!("c"; "coord_main exited: {}", e);
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

#[cfg(test)]
mod coord_args_tests {
    use super::*;

    #[test]
    fn sanitize_valid() -> Result<(), SteppeError> {
        let args = CliArgs {
            client_addr: "127.0.0.1:52700".parse()?,
            worker_addr: "127.0.0.1:52710".parse()?,
            threads: 2,
            config: None,
        };
        args.sanitize()
    }

    #[test]
    fn sanitize_privileged_port() -> Result<(), SteppeError> {
        let args = CliArgs {
            client_addr: "127.0.0.1:1023".parse()?,
            worker_addr: "127.0.0.1:52710".parse()?,
            threads: 2,
            config: None,
        };
        assert!(args.sanitize().is_err());
        Ok(())
    }

    #[test]
    fn sanitize_same_addr() -> Result<(), SteppeError> {
        let args = CliArgs {
            client_addr: "127.0.0.1:52700".parse()?,
            worker_addr: "127.0.0.1:52700".parse()?,
            threads: 2,
            config: None,
        };
        assert!(args.sanitize().is_err());
        Ok(())
    }

    #[test]
    fn sanitize_invalid_threads() -> Result<(), SteppeError> {
        let args = CliArgs {
            client_addr: "127.0.0.1:52700".parse()?,
            worker_addr: "127.0.0.1:52710".parse()?,
            threads: 1,
            config: None,
        };
        assert!(args.sanitize().is_err());
        Ok(())
    }
}
