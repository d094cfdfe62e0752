mod args;

use std::process::ExitCode;

use clap::Parser;
use tokio::net::UdpSocket;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn, Level};

use crate::args::Args;
use jobline_rs::lrcp::server;

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

    let socket = match UdpSocket::bind((args.listen, args.port)).await {
        Ok(s) => s,
        Err(error) => {
            error!(%error, "failed to bind socket");
            return ExitCode::from(111);
        },
    };

    match server::run(socket, cancel).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            error!(%error, "encountered runtime error");
            ExitCode::FAILURE
        },
    }
}
