mod args;

use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::{select, signal};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn, Level};

use crate::args::Args;
use jobline_rs::jobs::client;
use jobline_rs::jobs::job::ClientId;
use jobline_rs::jobs::store::{self, SharedStore};

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let args = Args::parse();

    // Logging
    if args.debug {
        tracing_subscriber::fmt()
            .with_max_level(Level::TRACE)
            .init();
    } else {
        tracing_subscriber::fmt().json().init();
    }

    // Cancellation and termination channel.
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(error) = signal::ctrl_c().await {
                warn!(%error, "something strange with ctrl-c handling!");
            };
            cancel.cancel();
        });
    }

    let listener = match TcpListener::bind((args.listen, args.port)).await {
        Ok(l) => l,
        Err(error) => {
            error!(%error, "failed to listen for connections");
            return ExitCode::from(111);
        },
    };

    // The one store for the whole process, created here and injected into
    // every connection task.
    let store = store::shared();

    let (shutdown_hold, mut shutdown_wait) = mpsc::channel::<()>(1);

    let exit_code =
        match accept_loop(cancel, shutdown_hold, listener, store).await {
            Ok(()) => ExitCode::SUCCESS,
            Err(error) => {
                error!(%error, "encountered runtime error");
                ExitCode::FAILURE
            },
        };

    shutdown_wait.recv().await;

    exit_code
}

async fn accept_loop(
    cancel: CancellationToken,
    shutdown_hold: mpsc::Sender<()>,
    listener: TcpListener,
    store: SharedStore,
) -> Result<()> {
    info!(addr = %listener.local_addr()?, "listening");

    let mut next_client = 0u64;

    // Accept incoming connections until an exit signal is sent, and handle
    // each connection as its own task.
    loop {
        match select! {
            accept = listener.accept() => accept,
            _ = cancel.cancelled() => return Ok(()),
        } {
            Ok((conn, _)) => {
                next_client += 1;
                tokio::spawn(serve_client(
                    cancel.clone(),
                    shutdown_hold.clone(),
                    conn,
                    store.clone(),
                    ClientId(next_client),
                ));
            },
            Err(error) => {
                warn!(%error, "failed to accept connection");
                continue;
            },
        };
    }
}

#[instrument(name = "conn", err(level = Level::WARN), fields(peer = %conn.peer_addr()?), skip_all)]
async fn serve_client(
    cancel: CancellationToken,
    _shutdown_hold: mpsc::Sender<()>,
    conn: TcpStream,
    store: SharedStore,
    id: ClientId,
) -> Result<()> {
    conn.set_nodelay(true).context("setting NODELAY")?;

    client::run(conn, store, id, cancel).await
}
