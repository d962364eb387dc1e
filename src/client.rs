//! WebSocket client
//!
//! Performs the client side of the HTTP/1.1 upgrade over any stream (plain
//! TCP, TLS, in-memory) and hands back a client-role [`Connection`].
//!
//! ```ignore
//! use tokio::net::TcpStream;
//! use ws_wire::{Config, client};
//!
//! let stream = TcpStream::connect("127.0.0.1:9001").await?;
//! let (conn, mut events) = client::connect(stream, "127.0.0.1:9001", "/", Config::default()).await?;
//! conn.send_text("hello").await?;
//! ```

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::Config;
use crate::connection::{Connection, Events};
use crate::error::{Error, Result};
use crate::handshake::{
    build_request, generate_key, parse_response, read_head, validate_accept_key,
};

/// Upgrade `stream` to a WebSocket connection.
///
/// Sends the upgrade request for `path` on `host`, then requires a
/// `101 Switching Protocols` answer carrying the matching
/// `Sec-WebSocket-Accept`. Bytes the server sent after its response head
/// are fed to the connection before anything else.
pub async fn connect<S>(
    mut stream: S,
    host: &str,
    path: &str,
    config: Config,
) -> Result<(Connection, Events)>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let key = generate_key();
    stream.write_all(&build_request(host, path, &key)).await?;
    stream.flush().await?;

    let (response, head) =
        read_head(&mut stream, config.max_handshake_size, parse_response).await?;

    if response.status != 101 {
        return Err(Error::HandshakeFailed("expected 101 Switching Protocols"));
    }
    let accept = response
        .accept
        .ok_or(Error::HandshakeFailed("missing Sec-WebSocket-Accept"))?;
    if !validate_accept_key(&key, &accept) {
        return Err(Error::HandshakeFailed("Sec-WebSocket-Accept mismatch"));
    }

    let (conn, events) = Connection::client(stream, config, head);
    debug!(id = conn.id(), host, path, "client connected");
    Ok((conn, events))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handshake::{UpgradeRequest, build_response, generate_accept_key};
    use crate::protocol::Message;
    use crate::frame::Frame;
    use bytes::Bytes;
    use tokio::io::DuplexStream;

    /// Answer the upgrade on the server end of a duplex pipe
    async fn answer(mut server: DuplexStream, response: impl FnOnce(&str) -> Bytes) -> DuplexStream {
        let (req, _) = read_head(&mut server, 8192, UpgradeRequest::parse)
            .await
            .unwrap();
        let key = req.header("sec-websocket-key").unwrap().to_string();
        server.write_all(&response(&key)).await.unwrap();
        server
    }

    #[tokio::test]
    async fn test_connect_and_receive_trailing_frame() {
        let (client_io, server_io) = tokio::io::duplex(4096);
        let peer = tokio::spawn(answer(server_io, |key| {
            let mut bytes = build_response(&generate_accept_key(key)).to_vec();
            // A frame sent right behind the 101
            bytes.extend_from_slice(&Frame::text("welcome").to_bytes());
            Bytes::from(bytes)
        }));

        let (conn, mut events) = connect(client_io, "localhost", "/", Config::default())
            .await
            .unwrap();
        assert_eq!(conn.role(), crate::Role::Client);
        assert_eq!(events.next_message().await, Some(Message::text("welcome")));
        drop(peer);
    }

    #[tokio::test]
    async fn test_connect_rejects_bad_accept() {
        let (client_io, server_io) = tokio::io::duplex(4096);
        tokio::spawn(answer(server_io, |_| build_response("bm90IHRoZSByaWdodCBrZXk=")));

        let err = connect(client_io, "localhost", "/", Config::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::HandshakeFailed(_)));
    }

    #[tokio::test]
    async fn test_connect_rejects_non_101() {
        let (client_io, server_io) = tokio::io::duplex(4096);
        tokio::spawn(answer(server_io, |_| {
            crate::handshake::Rejection::new(400, "no").response()
        }));

        let err = connect(client_io, "localhost", "/", Config::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::HandshakeFailed(_)));
    }
}
