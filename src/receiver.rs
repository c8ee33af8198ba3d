//! Receiver-side rendezvous.
//!
//! Each receiver connection is TLS-terminated by the listener and handed
//! here, where it is wrapped in a yamux multiplexer. The peer opens the
//! control stream and sends one auth request; the relay mints a token,
//! opens the outbound data stream, parks it in the token directory and
//! answers with the token. The connection task then keeps the multiplexer
//! engine turning so the parked stream (and a later splice) can make
//! progress, while a liveness monitor evicts the token if the receiver
//! vanishes before a sender claims it.

use crate::directory::TokenDirectory;
use crate::wire::{self, ClientRequest, ClientResponse};
use anyhow::{Context, Result, anyhow};
use std::future::{Future, poll_fn};
use std::net::SocketAddr;
use std::pin::pin;
use std::sync::Arc;
use std::task::Poll;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;
use tokio::time::timeout;
use tokio_util::compat::{Compat, FuturesAsyncReadCompatExt, TokioAsyncReadCompatExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use yamux::{Config as MuxConfig, Connection, Mode};

/// A multiplexed stream as tokio-flavoured IO. The parked data stream and
/// the control stream are both of this type.
pub type DataStream = Compat<yamux::Stream>;

/// The process-wide table of parked receivers.
pub type Directory = Arc<TokenDirectory<DataStream>>;

type MuxConnection<S> = Connection<Compat<S>>;

/// Bound on the whole control exchange, from TLS handshake completion to
/// the token response leaving the relay.
pub const CONTROL_DEADLINE: Duration = Duration::from_secs(30);

/// How often the liveness monitor re-checks a parked session.
pub const LIVENESS_INTERVAL: Duration = Duration::from_secs(5);

/// Runs one receiver connection to completion: control exchange, token
/// minting, parking, then pumping the multiplexer until the peer goes away.
pub async fn handle_connection<S>(
    stream: S,
    peer: SocketAddr,
    directory: Directory,
    shutdown: CancellationToken,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let mut connection = Connection::new(stream.compat(), MuxConfig::default(), Mode::Server);

    let parked = match timeout(CONTROL_DEADLINE, establish(&mut connection, &directory)).await {
        Ok(Ok(parked)) => parked,
        Ok(Err(e)) => {
            let _ = poll_fn(|cx| connection.poll_close(cx)).await;
            return Err(e);
        }
        Err(_) => {
            let _ = poll_fn(|cx| connection.poll_close(cx)).await;
            return Err(anyhow!("Control exchange timed out"));
        }
    };
    info!(%peer, token = %parked.token, "Receiver parked");

    let (closed_tx, closed_rx) = watch::channel(false);
    tokio::spawn(monitor_session(
        directory.clone(),
        parked.token.clone(),
        closed_rx,
    ));

    run_parked(&mut connection, &directory, &parked.token, &shutdown).await;

    let _ = closed_tx.send(true);
    let _ = poll_fn(|cx| connection.poll_close(cx)).await;
    debug!(%peer, "Receiver connection closed");
    Ok(())
}

/// A parked session: the minted token, plus the control stream held open
/// (write-closed on our side) until the peer lets go of it.
struct Parked {
    token: String,
    _control: DataStream,
}

async fn establish<S>(connection: &mut MuxConnection<S>, directory: &Directory) -> Result<Parked>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    // The peer's first inbound stream is the control stream.
    let control = poll_fn(|cx| connection.poll_next_inbound(cx))
        .await
        .ok_or_else(|| anyhow!("Multiplexer closed before the control stream arrived"))?
        .context("Failed to accept control stream")?;
    let mut control = control.compat();

    let request: ClientRequest = drive(connection, wire::recv_frame(&mut control))
        .await
        .context("Failed to read auth request")?;
    // auth_token is reserved and may be empty; intention does not route.
    debug!(intention = %request.intention, "Auth request received");

    let data = open_data_stream(connection)
        .await
        .context("Failed to open data stream")?;

    let mut token = directory.generate();
    if let Err(stream) = directory.publish(&token, data.compat()) {
        warn!("Token collision, regenerating");
        token = directory.generate();
        if directory.publish(&token, stream).is_err() {
            error!("Token collision survived regeneration, dropping receiver");
            return Err(anyhow!("Token collision survived regeneration"));
        }
    }
    // The token is resolvable from this point on. Anything that goes wrong
    // before the session is parked must roll the entry back.
    let guard = PublishGuard {
        directory: directory.clone(),
        token: Some(token.clone()),
    };

    let response = ClientResponse {
        token: token.clone(),
    };
    drive(connection, wire::send_frame(&mut control, &response))
        .await
        .context("Failed to send token response")?;
    // Half-close our side; the peer may keep the stream open.
    drive(connection, async {
        control.shutdown().await.map_err(anyhow::Error::from)
    })
    .await
    .context("Failed to close control stream")?;

    guard.disarm();
    Ok(Parked {
        token,
        _control: control,
    })
}

/// Rolls a published token back if the control exchange dies between
/// publication and parking.
struct PublishGuard {
    directory: Directory,
    token: Option<String>,
}

impl PublishGuard {
    fn disarm(mut self) {
        self.token = None;
    }
}

impl Drop for PublishGuard {
    fn drop(&mut self) {
        if let Some(token) = self.token.take() {
            self.directory.expire(&token);
        }
    }
}

/// Polls the multiplexer engine once, discarding surplus inbound streams.
/// Ready means the connection is finished, cleanly or not.
fn poll_engine<S>(
    connection: &mut MuxConnection<S>,
    cx: &mut std::task::Context<'_>,
) -> Poll<Result<()>>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    loop {
        match connection.poll_next_inbound(cx) {
            Poll::Ready(Some(Ok(stream))) => {
                debug!("Discarding unexpected inbound stream");
                drop(stream);
            }
            Poll::Ready(Some(Err(e))) => return Poll::Ready(Err(anyhow::Error::new(e))),
            Poll::Ready(None) => return Poll::Ready(Ok(())),
            Poll::Pending => return Poll::Pending,
        }
    }
}

/// Runs `operation` to completion while keeping the multiplexer engine
/// turning. Stream reads and writes only make progress while the
/// connection itself is polled.
async fn drive<S, F, T>(connection: &mut MuxConnection<S>, operation: F) -> Result<T>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    F: Future<Output = Result<T>>,
{
    let mut operation = pin!(operation);
    poll_fn(|cx| {
        match poll_engine(connection, cx) {
            Poll::Ready(Ok(())) => {
                return Poll::Ready(Err(anyhow!("Multiplexer closed during control exchange")));
            }
            Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
            Poll::Pending => {}
        }
        operation.as_mut().poll(cx)
    })
    .await
}

async fn open_data_stream<S>(connection: &mut MuxConnection<S>) -> Result<yamux::Stream>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    poll_fn(|cx| {
        match poll_engine(connection, cx) {
            Poll::Ready(Ok(())) => {
                return Poll::Ready(Err(anyhow!("Multiplexer closed before the data stream opened")));
            }
            Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
            Poll::Pending => {}
        }
        match connection.poll_new_outbound(cx) {
            Poll::Ready(Ok(stream)) => Poll::Ready(Ok(stream)),
            Poll::Ready(Err(e)) => Poll::Ready(Err(anyhow::Error::new(e))),
            Poll::Pending => Poll::Pending,
        }
    })
    .await
}

/// Keeps the engine turning for a parked (or spliced) session until the
/// peer disconnects. On shutdown a still-parked token is evicted and the
/// connection closed; a session whose stream was already taken by a sender
/// drains first so the splice can finish.
async fn run_parked<S>(
    connection: &mut MuxConnection<S>,
    directory: &Directory,
    token: &str,
    shutdown: &CancellationToken,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let mut draining = false;
    loop {
        tokio::select! {
            finished = poll_fn(|cx| poll_engine(connection, cx)) => {
                match finished {
                    Ok(()) => debug!("Receiver multiplexer closed"),
                    Err(e) => debug!(error = %e, "Receiver multiplexer failed"),
                }
                break;
            }
            _ = shutdown.cancelled(), if !draining => {
                if directory.expire(token) {
                    info!(token = %token, "Shutting down, parked receiver evicted");
                    break;
                }
                draining = true;
            }
        }
    }
}

/// Liveness monitor for one parked session. Ticks every few seconds and
/// also reacts to the connection's closed signal straight away; evicts the
/// token if the receiver vanished before a sender claimed it.
async fn monitor_session(directory: Directory, token: String, mut closed: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(LIVENESS_INTERVAL);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            changed = closed.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
        if *closed.borrow() {
            break;
        }
    }
    if directory.expire(&token) {
        info!(token = %token, "Receiver vanished, token evicted");
    }
}
