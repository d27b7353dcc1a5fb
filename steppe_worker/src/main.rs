//! Steppe worker node executable.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use env_logger::Env;

use steppe::{pf_error, GraphWorker, SteppeError, WorkerConfig, WorkerId};

use tokio::runtime::Builder;

/// Command line arguments definition.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct CliArgs {
    /// Configured worker ID of myself (stable across restarts).
    #[arg(short, long)]
    id: WorkerId,

    /// Coordinator's worker-facing API address.
    #[arg(short, long, default_value = "127.0.0.1:52710")]
    coord_addr: SocketAddr,

    /// Peer-to-peer message address to listen on.
    #[arg(short, long, default_value = "127.0.0.1:52800")]
    p2p_addr: SocketAddr,

    /// Failure detector ack address to listen on.
    #[arg(short, long, default_value = "127.0.0.1:52900")]
    fcheck_addr: SocketAddr,

    /// Path of my local checkpoint database file. Defaults to
    /// './checkpoints-<id>.db'.
    #[arg(long)]
    checkpoint_path: Option<PathBuf>,

    /// Number of tokio worker threads.
    #[arg(long, default_value_t = 2)]
    threads: usize,
}

impl CliArgs {
    /// Sanitize command line arguments, returning `Ok(worker_config)` on
    /// success or `Err(SteppeError)` on any error.
    fn sanitize(&self) -> Result<WorkerConfig, SteppeError> {
        if self.p2p_addr.port() <= 1024 {
            return Err(SteppeError(format!(
                "invalid p2p_addr port {}",
                self.p2p_addr.port()
            )));
        }
        if self.fcheck_addr.port() <= 1024 {
            return Err(SteppeError(format!(
                "invalid fcheck_addr port {}",
                self.fcheck_addr.port()
            )));
        }
        if self.p2p_addr == self.fcheck_addr
            || self.p2p_addr == self.coord_addr
        {
            return Err(SteppeError(format!(
                "p2p_addr '{}' clashes with another address",
                self.p2p_addr
            )));
        }
        if self.threads < 2 {
            return Err(SteppeError(format!(
                "invalid number of threads {}",
                self.threads
            )));
        }

        Ok(WorkerConfig {
            id: self.id,
            coord_addr: self.coord_addr,
            p2p_addr: self.p2p_addr,
            fcheck_addr: self.fcheck_addr,
            checkpoint_path: self.checkpoint_path.clone().unwrap_or_else(
                || PathBuf::from(format!("./checkpoints-{}.db", self.id)),
            ),
        })
    }
}

// Worker node executable main entrance.
fn worker_main() -> Result<(), SteppeError> {
    // read in and parse command line arguments
    let args = CliArgs::parse();
    let config = args.sanitize()?;

    // create tokio multi-threaded runtime
    let runtime = Builder::new_multi_thread()
        .enable_all()
        .worker_threads(args.threads)
        .thread_name("tokio-worker-worker")
        .build()?;

    // enter tokio runtime, join the coordinator, and wait for work to do
    runtime.block_on(async move {
        let mut worker = GraphWorker::new_and_setup(config).await?;
        worker.run().await;
        Ok::<(), SteppeError>(())
    })?;

    Ok(())
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(Env::default().default_filter_or("info"))
        .init();

    if let Err(e) = worker_main() {
        pf_error!("w"; "worker_main exited: {}", e);
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

#[cfg(test)]
mod worker_args_tests {
    use super::*;

    fn base_args() -> CliArgs {
        CliArgs {
            id: 0,
            coord_addr: "127.0.0.1:52710".parse().unwrap(),
            p2p_addr: "127.0.0.1:52800".parse().unwrap(),
            fcheck_addr: "127.0.0.1:52900".parse().unwrap(),
            checkpoint_path: None,
            threads: 2,
        }
    }

    #[test]
    fn sanitize_valid() -> Result<(), SteppeError> {
        let config = base_args().sanitize()?;
        assert_eq!(
            config.checkpoint_path,
            PathBuf::from("./checkpoints-0.db")
        );
        Ok(())
    }

    #[test]
    fn sanitize_clashing_addrs() {
        let mut args = base_args();
        args.fcheck_addr = args.p2p_addr;
        assert!(args.sanitize().is_err());
    }

    #[test]
    fn sanitize_privileged_port() {
        let mut args = base_args();
        args.p2p_addr = "127.0.0.1:80".parse().unwrap();
        assert!(args.sanitize().is_err());
    }

    #[test]
    fn sanitize_invalid_threads() {
        let mut args = base_args();
        args.threads = 0;
        assert!(args.sanitize().is_err());
    }
}
