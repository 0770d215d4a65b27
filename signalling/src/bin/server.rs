// SPDX-License-Identifier: MPL-2.0

use anyhow::Error;
use audiolink_signalling::handlers::Handler;
use audiolink_signalling::server::Server;
use clap::Parser;
use futures::future;
use tokio::net::TcpListener;
use tokio::task;
use tracing::{info, warn};
use tracing_subscriber::prelude::*;

#[derive(Parser, Debug)]
#[clap(about, version, author)]
/// Program arguments
struct Args {
    /// Address to listen on
    #[clap(long, env = "HOST", default_value = "localhost")]
    host: String,
    /// Port to listen on
    #[clap(short, long, env = "PORT", default_value_t = 3001)]
    port: u16,
}

fn initialize_logging(envvar_name: &str) -> Result<(), Error> {
    tracing_log::LogTracer::init()?;
    let env_filter = tracing_subscriber::EnvFilter::try_from_env(envvar_name)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_thread_ids(true)
        .with_target(true)
        .with_span_events(
            tracing_subscriber::fmt::format::FmtSpan::NEW
                | tracing_subscriber::fmt::format::FmtSpan::CLOSE,
        );
    let subscriber = tracing_subscriber::Registry::default()
        .with(env_filter)
        .with(fmt_layer);
    tracing::subscriber::set_global_default(subscriber)?;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl-C: {}", err);
            future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                warn!("Failed to install SIGTERM handler: {}", err);
                future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    let args = Args::parse();

    initialize_logging("AUDIOLINK_SIGNALLING_SERVER_LOG")?;

    let server = Server::spawn(Handler::new);

    let addr = format!("{}:{}", args.host, args.port);

    // Create the event loop and TCP listener we'll accept connections on.
    let listener = TcpListener::bind(&addr).await?;

    info!("Listening on: {}", addr);

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            res = listener.accept() => {
                match res {
                    Ok((stream, address)) => {
                        let mut server_clone = server.clone();
                        info!("Accepting connection from {}", address);
                        task::spawn(async move { server_clone.accept_async(stream).await });
                    }
                    Err(err) => {
                        warn!("Failed to accept connection: {}", err);
                    }
                }
            }
            _ = &mut shutdown => {
                info!(
                    connections = server.connection_count(),
                    "Shutting down"
                );
                break;
            }
        }
    }

    Ok(())
}
