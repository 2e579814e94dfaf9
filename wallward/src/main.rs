use std::process;
use std::sync::Arc;

use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

use wallward_lib::docker::DockerRuntime;
use wallward_lib::nft::kernel::Nftables;
use wallward_lib::reconcile::Reconciler;
use wallward_lib::store::Store;

mod cli;
mod logging;

async fn daemon(args: cli::Cli) -> exitcode::ExitCode {
    let store = match Store::open(&args.data_dir) {
        Ok(store) => store,
        Err(error) => {
            tracing::error!(%error, data_dir = %args.data_dir.display(), "cannot open persistent store");
            return exitcode::IOERR;
        }
    };
    let runtime = match DockerRuntime::connect() {
        Ok(runtime) => Arc::new(runtime),
        Err(error) => {
            tracing::error!(%error, "cannot reach the container runtime");
            return exitcode::UNAVAILABLE;
        }
    };
    let cancel = CancellationToken::new();
    let reconciler = Reconciler::new(runtime, Arc::new(Nftables::new()), store, cancel.clone());

    if args.clear {
        return match reconciler.clear().await {
            Ok(()) => exitcode::OK,
            Err(error) => {
                tracing::error!(%error, "clearing rules failed");
                exitcode::SOFTWARE
            }
        };
    }

    if let Err(error) = reconciler.start().await {
        tracing::error!(%error, "startup failed");
        return exitcode::SOFTWARE;
    }

    let mut sigint = match signal(SignalKind::interrupt()) {
        Ok(sig) => sig,
        Err(error) => {
            tracing::error!(?error, "error setting up SIGINT handler");
            return exitcode::OSERR;
        }
    };
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sig) => sig,
        Err(error) => {
            tracing::error!(?error, "error setting up SIGTERM handler");
            return exitcode::OSERR;
        }
    };

    tokio::select! {
        _ = sigint.recv() => tracing::info!("received SIGINT"),
        _ = sigterm.recv() => tracing::info!("received SIGTERM"),
    }

    tracing::info!("shutting down");
    reconciler.stop().await;
    exitcode::OK
}

#[tokio::main]
async fn main() {
    let args = cli::parse();

    if let Err(error) = logging::init(&args.log, args.debug) {
        eprintln!("failed to open log sink {}: {error}", args.log);
        process::exit(exitcode::IOERR);
    }
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        "starting {}",
        env!("CARGO_PKG_NAME")
    );

    let exit = daemon(args).await;

    if exit != exitcode::OK {
        tracing::warn!("abnormal exit");
    }
    process::exit(exit)
}
