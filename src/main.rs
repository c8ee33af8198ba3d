use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use bie_relay::config::{Config, LogType, load_config};
use bie_relay::receiver::Directory;
use bie_relay::{TokenDirectory, certs, receiver, sender};

/// Bound on the receiver-side TLS handshake.
const TLS_HANDSHAKE_DEADLINE: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<()> {
    let config = load_config()?;
    init_logging(&config);

    let cert_source = certs::CertificateSource::load(&config.cert_file, &config.key_file)
        .context("Failed to load server certificate")?;
    certs::spawn_reload_task(cert_source.clone(), config.domain.clone());
    let tls_acceptor = TlsAcceptor::from(Arc::new(cert_source.server_config()));

    let directory: Directory = Arc::new(TokenDirectory::new(&config.shard_id));

    let receiver_listener = TcpListener::bind(("0.0.0.0", config.receiver_port))
        .await
        .with_context(|| format!("Failed to bind receiver port {}", config.receiver_port))?;
    let sender_listener = TcpListener::bind(("0.0.0.0", config.sender_port))
        .await
        .with_context(|| format!("Failed to bind sender port {}", config.sender_port))?;

    info!(
        domain = %config.domain,
        shard = %config.shard_id,
        sender_port = config.sender_port,
        receiver_port = config.receiver_port,
        "Relay server running"
    );

    let shutdown = CancellationToken::new();
    let tracker = TaskTracker::new();

    tracker.spawn(accept_receivers(
        receiver_listener,
        tls_acceptor,
        directory.clone(),
        shutdown.clone(),
        tracker.clone(),
    ));
    tracker.spawn(accept_senders(
        sender_listener,
        directory.clone(),
        shutdown.clone(),
        tracker.clone(),
    ));

    wait_for_signal().await?;
    info!("Shutting down servers");

    // Stop accepting, evict parked receivers, let in-flight splices finish,
    // and join every connection task before exiting.
    shutdown.cancel();
    tracker.close();
    tracker.wait().await;

    info!("Servers stopped gracefully");
    Ok(())
}

async fn accept_receivers(
    listener: TcpListener,
    tls_acceptor: TlsAcceptor,
    directory: Directory,
    shutdown: CancellationToken,
    tracker: TaskTracker,
) {
    loop {
        let (stream, peer) = tokio::select! {
            biased;
            _ = shutdown.cancelled() => return,
            accepted = listener.accept() => match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    error!(error = %e, "Failed to accept receiver connection");
                    continue;
                }
            },
        };

        let tls_acceptor = tls_acceptor.clone();
        let directory = directory.clone();
        let shutdown = shutdown.clone();
        tracker.spawn(async move {
            let tls_stream = match timeout(TLS_HANDSHAKE_DEADLINE, tls_acceptor.accept(stream)).await
            {
                Ok(Ok(tls_stream)) => tls_stream,
                Ok(Err(e)) => {
                    info!(%peer, error = %e, "TLS handshake failed");
                    return;
                }
                Err(_) => {
                    info!(%peer, "TLS handshake timed out");
                    return;
                }
            };
            if let Err(e) = receiver::handle_connection(tls_stream, peer, directory, shutdown).await
            {
                warn!(%peer, error = %e, "Receiver session failed");
            }
        });
    }
}

async fn accept_senders(
    listener: TcpListener,
    directory: Directory,
    shutdown: CancellationToken,
    tracker: TaskTracker,
) {
    loop {
        let (stream, peer) = tokio::select! {
            biased;
            _ = shutdown.cancelled() => return,
            accepted = listener.accept() => match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    error!(error = %e, "Failed to accept sender connection");
                    continue;
                }
            },
        };

        let directory = directory.clone();
        tracker.spawn(async move {
            if let Err(e) = sender::handle_connection(stream, peer, directory).await {
                debug!(%peer, error = %e, "Sender connection failed");
            }
        });
    }
}

fn init_logging(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone()));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match config.log_type {
        LogType::Json => builder.json().init(),
        LogType::Text => builder.init(),
    }
}

async fn wait_for_signal() -> Result<()> {
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .context("Failed to install SIGTERM handler")?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result.context("Failed to listen for SIGINT"),
        _ = sigterm.recv() => Ok(()),
    }
}
