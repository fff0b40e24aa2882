//! Wrapper that owns a yamux connection and exposes it as a session handle.
//!
//! The yamux state machine wants a single owner polling it, while the rest of
//! the process opens and accepts streams from many tasks. A dedicated driver
//! task polls the connection; handles talk to it over channels.

use std::collections::VecDeque;
use std::fmt;
use std::future::poll_fn;
use std::task::{Context, Poll};

use futures::io::{AsyncRead as FuturesAsyncRead, AsyncWrite as FuturesAsyncWrite};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{Mutex, mpsc, oneshot, watch};
use tokio_util::compat::{Compat, FuturesAsyncReadCompatExt, TokioAsyncReadCompatExt};
use tracing::debug;

/// One logical byte stream multiplexed over the tunnel connection.
pub type MuxStream = Compat<yamux::Stream>;

#[derive(Debug)]
pub enum MuxError {
    /// The session is gone; no more streams can be opened on it.
    Closed,
    Connection(yamux::ConnectionError),
}

impl fmt::Display for MuxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MuxError::Closed => write!(f, "session closed"),
            MuxError::Connection(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for MuxError {}

enum Command {
    Open(oneshot::Sender<Result<yamux::Stream, yamux::ConnectionError>>),
    Close,
}

/// Handle to a live multiplexed session. Dropping the handle shuts the
/// underlying connection down.
pub struct MuxSession {
    command_tx: mpsc::UnboundedSender<Command>,
    inbound_rx: Mutex<mpsc::UnboundedReceiver<yamux::Stream>>,
    closed_rx: watch::Receiver<bool>,
}

impl MuxSession {
    /// Wrap the dialing side of a tunnel connection.
    pub fn client<T>(io: T) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        Self::new(io, yamux::Mode::Client)
    }

    /// Wrap the accepting side of a tunnel connection.
    pub fn server<T>(io: T) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        Self::new(io, yamux::Mode::Server)
    }

    fn new<T>(io: T, mode: yamux::Mode) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let connection = yamux::Connection::new(io.compat(), session_config(), mode);
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (closed_tx, closed_rx) = watch::channel(false);

        tokio::spawn(drive(connection, command_rx, inbound_tx, closed_tx));

        Self {
            command_tx,
            inbound_rx: Mutex::new(inbound_rx),
            closed_rx,
        }
    }

    /// Open a new outbound stream on the session.
    pub async fn open_stream(&self) -> Result<MuxStream, MuxError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.command_tx
            .send(Command::Open(reply_tx))
            .map_err(|_| MuxError::Closed)?;
        match reply_rx.await {
            Ok(Ok(stream)) => Ok(stream.compat()),
            Ok(Err(err)) => Err(MuxError::Connection(err)),
            Err(_) => Err(MuxError::Closed),
        }
    }

    /// Wait for the next stream opened by the peer. Returns `None` once the
    /// session is closed.
    pub async fn accept_stream(&self) -> Option<MuxStream> {
        let mut inbound = self.inbound_rx.lock().await;
        inbound.recv().await.map(FuturesAsyncReadCompatExt::compat)
    }

    /// Shut the whole session down and wait for the connection to terminate.
    pub async fn close(&self) {
        let _ = self.command_tx.send(Command::Close);
        self.closed().await;
    }

    pub fn is_closed(&self) -> bool {
        *self.closed_rx.borrow()
    }

    /// Resolves once the session has terminated, whatever the cause.
    pub async fn closed(&self) {
        let mut closed_rx = self.closed_rx.clone();
        // The driver flips the flag before exiting; a dropped sender counts
        // as closed as well.
        let _ = closed_rx.wait_for(|closed| *closed).await;
    }
}

fn session_config() -> yamux::Config {
    let mut config = yamux::Config::default();
    config.set_max_num_streams(1024);
    config
}

async fn drive<T>(
    mut connection: yamux::Connection<T>,
    mut command_rx: mpsc::UnboundedReceiver<Command>,
    inbound_tx: mpsc::UnboundedSender<yamux::Stream>,
    closed_tx: watch::Sender<bool>,
) where
    T: FuturesAsyncRead + FuturesAsyncWrite + Unpin,
{
    let mut pending_opens: VecDeque<
        oneshot::Sender<Result<yamux::Stream, yamux::ConnectionError>>,
    > = VecDeque::new();
    let mut closing = false;

    let result = poll_fn(|cx| {
        poll_session(
            cx,
            &mut connection,
            &mut command_rx,
            &mut pending_opens,
            &mut closing,
            &inbound_tx,
        )
    })
    .await;

    match result {
        Ok(()) => debug!("multiplexed session closed"),
        Err(err) => debug!(%err, "multiplexed session terminated"),
    }

    // Outstanding open requests observe the closure through their dropped
    // reply channels.
    let _ = closed_tx.send(true);
}

fn poll_session<T>(
    cx: &mut Context<'_>,
    connection: &mut yamux::Connection<T>,
    command_rx: &mut mpsc::UnboundedReceiver<Command>,
    pending_opens: &mut VecDeque<oneshot::Sender<Result<yamux::Stream, yamux::ConnectionError>>>,
    closing: &mut bool,
    inbound_tx: &mpsc::UnboundedSender<yamux::Stream>,
) -> Poll<Result<(), yamux::ConnectionError>>
where
    T: FuturesAsyncRead + FuturesAsyncWrite + Unpin,
{
    if !*closing {
        loop {
            match command_rx.poll_recv(cx) {
                Poll::Ready(Some(Command::Open(reply))) => pending_opens.push_back(reply),
                // All handles dropped or an explicit close requested.
                Poll::Ready(Some(Command::Close)) | Poll::Ready(None) => {
                    *closing = true;
                    break;
                }
                Poll::Pending => break,
            }
        }
    }

    if *closing {
        return connection.poll_close(cx);
    }

    while !pending_opens.is_empty() {
        match connection.poll_new_outbound(cx) {
            Poll::Ready(result) => {
                if let Some(reply) = pending_opens.pop_front() {
                    let _ = reply.send(result);
                }
            }
            Poll::Pending => break,
        }
    }

    loop {
        match connection.poll_next_inbound(cx) {
            Poll::Ready(Some(Ok(stream))) => {
                if inbound_tx.send(stream).is_err() {
                    *closing = true;
                    return connection.poll_close(cx);
                }
            }
            Poll::Ready(Some(Err(err))) => return Poll::Ready(Err(err)),
            Poll::Ready(None) => return Poll::Ready(Ok(())),
            Poll::Pending => return Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn session_pair() -> (MuxSession, MuxSession) {
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        (MuxSession::client(client_io), MuxSession::server(server_io))
    }

    #[tokio::test]
    async fn open_accept_and_exchange_bytes() {
        let (client, server) = session_pair();

        let echo = tokio::spawn(async move {
            let mut stream = server.accept_stream().await.expect("inbound stream");
            let mut buf = [0u8; 4];
            stream.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"ping");
            stream.write_all(b"pong").await.unwrap();
            stream.shutdown().await.unwrap();
            server
        });

        let mut stream = client.open_stream().await.unwrap();
        stream.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");

        let server = echo.await.unwrap();
        drop(server);
        drop(client);
    }

    #[tokio::test]
    async fn half_close_delivers_eof() {
        let (client, server) = session_pair();

        let reader = tokio::spawn(async move {
            let mut stream = server.accept_stream().await.expect("inbound stream");
            let mut payload = Vec::new();
            stream.read_to_end(&mut payload).await.unwrap();
            (payload, server)
        });

        let mut stream = client.open_stream().await.unwrap();
        stream.write_all(b"complete message").await.unwrap();
        stream.shutdown().await.unwrap();

        let (payload, _server) = reader.await.unwrap();
        assert_eq!(payload, b"complete message");
    }

    #[tokio::test]
    async fn close_wakes_waiters_and_stops_accepts() {
        let (client, server) = session_pair();
        assert!(!client.is_closed());

        client.close().await;
        assert!(client.is_closed());

        // The peer observes the closure as end of inbound streams.
        assert!(server.accept_stream().await.is_none());
        server.closed().await;
        assert!(server.is_closed());
    }

    #[tokio::test]
    async fn open_after_close_fails() {
        let (client, server) = session_pair();
        client.close().await;

        match client.open_stream().await {
            Err(MuxError::Closed) | Err(MuxError::Connection(_)) => {}
            Ok(_) => panic!("open_stream should fail on a closed session"),
        }
        drop(server);
    }

    #[tokio::test]
    async fn peer_disconnect_is_observed() {
        let (client, server) = session_pair();

        drop(client);
        server.closed().await;
        assert!(server.is_closed());
    }
}
