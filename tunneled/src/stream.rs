use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use shared::{STREAM_ACK, is_connection_closed, parse_port, pipe::pipe};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, warn};

const LOCAL_SERVICE_TIMEOUT: Duration = Duration::from_secs(10);

// Five digits plus slack; anything longer is not a port header.
const MAX_PORT_LINE: usize = 8;

/// Serve one server-initiated stream: read the port header, dial the mapped
/// local service, acknowledge, then pump bytes until either side finishes.
pub(crate) async fn handle_stream<S>(mut stream: S, port_map: Arc<HashMap<u16, String>>)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let line = match read_port_line(&mut stream).await {
        Ok(line) => line,
        Err(err) => {
            if !is_connection_closed(&err) {
                warn!(%err, "failed to read port header");
            }
            return;
        }
    };

    let Some(port) = parse_port(&line) else {
        warn!(header = %line.trim(), "invalid port header");
        return;
    };

    let Some(local_addr) = port_map.get(&port) else {
        warn!(port, "no mapping for requested port");
        return;
    };

    let mut local = match timeout(LOCAL_SERVICE_TIMEOUT, TcpStream::connect(local_addr.as_str()))
        .await
    {
        Ok(Ok(conn)) => conn,
        Ok(Err(err)) => {
            warn!(port, %local_addr, %err, "failed to dial local service");
            return;
        }
        Err(_) => {
            warn!(port, %local_addr, "timed out dialing local service");
            return;
        }
    };

    if let Err(err) = stream.write_all(&STREAM_ACK).await {
        if !is_connection_closed(&err) {
            warn!(port, %err, "failed to acknowledge stream");
        }
        return;
    }

    debug!(port, %local_addr, "stream connected");
    pipe(&mut stream, &mut local, "stream/local").await;
    let _ = stream.shutdown().await;
    let _ = local.shutdown().await;
}

/// Read bytes up to the first line feed. The header is tiny, so a byte at a
/// time keeps the stream position exact for the payload that follows.
async fn read_port_line<R>(reader: &mut R) -> io::Result<String>
where
    R: AsyncRead + Unpin,
{
    let mut buf = Vec::with_capacity(MAX_PORT_LINE);
    loop {
        let mut byte = [0u8; 1];
        let read = reader.read(&mut byte).await?;
        if read == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "stream closed before port header",
            ));
        }
        if byte[0] == b'\n' {
            break;
        }
        if buf.len() >= MAX_PORT_LINE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "port header too long",
            ));
        }
        buf.push(byte[0]);
    }
    String::from_utf8(buf)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "port header is not UTF-8"))
}
