use std::fmt;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tracing::{debug, instrument};

use super::command::{self, Cmd, CommandRenames, FromFrame};
use super::config::ClientConfig;
use crate::proto::codec::{Decoder, Encoder};
use crate::proto::error::{Error, Result};
use crate::proto::frame::Frame;

const READ_CHUNK: usize = 4096;

/// Transport under a [`Connection`].
enum Stream {
    Tcp(TcpStream),
    #[cfg(feature = "tls")]
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl AsyncRead for Stream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Stream::Tcp(stream) => Pin::new(stream).poll_read(cx, buf),
            #[cfg(feature = "tls")]
            Stream::Tls(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Stream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Stream::Tcp(stream) => Pin::new(stream).poll_write(cx, buf),
            #[cfg(feature = "tls")]
            Stream::Tls(stream) => Pin::new(stream.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Stream::Tcp(stream) => Pin::new(stream).poll_flush(cx),
            #[cfg(feature = "tls")]
            Stream::Tls(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Stream::Tcp(stream) => Pin::new(stream).poll_shutdown(cx),
            #[cfg(feature = "tls")]
            Stream::Tls(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
        }
    }
}

cfg_if::cfg_if! {
    if #[cfg(feature = "tls")] {
        async fn wrap_stream(tcp: TcpStream, address: &str, tls: bool) -> Result<Stream> {
            if !tls {
                return Ok(Stream::Tcp(tcp));
            }
            let connector = super::tls::TlsConnectorInner::new()?;
            let stream = connector.connect(super::config::host_of(address), tcp).await?;
            Ok(Stream::Tls(Box::new(stream)))
        }
    } else {
        async fn wrap_stream(tcp: TcpStream, address: &str, tls: bool) -> Result<Stream> {
            if tls {
                return Err(Error::InvalidArgument {
                    message: format!("TLS requested for {} but the `tls` feature is disabled", address),
                });
            }
            Ok(Stream::Tcp(tcp))
        }
    }
}

/// A connection to one node.
///
/// Requests are buffered by [`send`](Connection::send) and written by
/// [`flush`](Connection::flush), so several requests can go out in one
/// write. Replies are read back one at a time, in order, by
/// [`receive`](Connection::receive).
///
/// A connection is used by one caller at a time; ownership moves through the
/// pool. Any transport failure marks it broken and the pool will not hand it
/// out again. The same goes for a connection with requests still buffered or
/// replies still owed, which is what a cancelled request leaves behind.
///
/// # Example
///
/// ```no_run
/// use shardis::core::command;
/// use shardis::core::config::ClientConfig;
/// use shardis::core::connection::Connection;
///
/// # async fn example() -> shardis::Result<()> {
/// let mut conn = Connection::open("127.0.0.1:6379", &ClientConfig::default()).await?;
/// let value: Option<String> = conn.query(&command::get("key")).await?;
/// # Ok(())
/// # }
/// ```
pub struct Connection {
    stream: Stream,
    address: String,
    decoder: Decoder,
    encoder: Encoder,
    renames: Arc<CommandRenames>,
    read_timeout: Option<Duration>,
    write_timeout: Option<Duration>,
    in_flight: usize,
    broken: bool,
}

impl Connection {
    /// Connects to `address` (`host:port`) and runs the handshake
    /// (AUTH, SELECT, CLIENT SETNAME) configured in `config`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the node cannot be reached in time,
    /// [`Error::Auth`] if authentication is rejected and [`Error::Server`]
    /// for other handshake failures.
    #[instrument(level = "debug", skip(config))]
    pub async fn open(address: &str, config: &ClientConfig) -> Result<Self> {
        let tcp = tokio::time::timeout(config.connect_timeout, TcpStream::connect(address))
            .await
            .map_err(|_| timed_out("connect"))??;
        tcp.set_nodelay(true)?;

        let stream = wrap_stream(tcp, address, config.tls).await?;
        let mut connection = Self {
            stream,
            address: address.to_string(),
            decoder: Decoder::new(),
            encoder: Encoder::new(),
            renames: Arc::clone(&config.renames),
            read_timeout: config.read_timeout,
            write_timeout: config.write_timeout,
            in_flight: 0,
            broken: false,
        };
        connection.handshake(config).await?;

        debug!(address, "connection established");
        Ok(connection)
    }

    async fn handshake(&mut self, config: &ClientConfig) -> Result<()> {
        if let Some(password) = &config.password {
            let cmd = match &config.username {
                Some(username) => command::auth_with_username(username.clone(), password.clone()),
                None => command::auth(password.clone()),
            };
            match self.execute(&cmd).await {
                Ok(_) => {}
                Err(Error::Server { .. }) => return Err(Error::Auth),
                Err(e) => return Err(e),
            }
        }

        if let Some(db) = config.database {
            self.query::<()>(&command::select(db)).await?;
        }

        if let Some(name) = &config.client_name {
            self.query::<()>(&command::client_setname(name.clone())).await?;
        }
        Ok(())
    }

    /// Address (`host:port`) of the node this connection talks to.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Returns true once a transport error has been observed.
    pub fn is_broken(&self) -> bool {
        self.broken
    }

    /// Number of sent requests whose replies have not been read yet.
    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    /// Returns true when nothing is buffered and no reply is owed, so the
    /// next request's reply will be the next frame read.
    pub fn is_in_sync(&self) -> bool {
        self.in_flight == 0 && self.encoder.is_empty()
    }

    /// Marks the connection unusable so the pool discards it.
    pub(crate) fn invalidate(&mut self) {
        self.broken = true;
    }

    /// Buffers a request without writing it.
    pub fn send(&mut self, cmd: &Cmd) {
        let parts = cmd.to_wire(&self.renames);
        self.encoder.encode_request(parts.iter());
        self.in_flight += 1;
    }

    /// Writes every buffered request.
    pub async fn flush(&mut self) -> Result<()> {
        if self.encoder.is_empty() {
            return Ok(());
        }
        let data = self.encoder.take();
        let limit = self.write_timeout;
        let stream = &mut self.stream;
        let write = async {
            stream.write_all(&data).await?;
            stream.flush().await
        };
        let result = match limit {
            Some(limit) => tokio::time::timeout(limit, write)
                .await
                .unwrap_or_else(|_| Err(timed_out("write"))),
            None => write.await,
        };
        result.map_err(|e| self.fail(e.into()))
    }

    /// Reads the next raw reply. Error replies are returned as
    /// [`Frame::Error`], not as `Err`.
    pub async fn receive(&mut self) -> Result<Frame> {
        loop {
            match self.decoder.decode() {
                Ok(Some(frame)) => {
                    self.in_flight = self.in_flight.saturating_sub(1);
                    return Ok(frame);
                }
                Ok(None) => {}
                Err(e) => return Err(self.fail(e)),
            }

            let mut buf = [0u8; READ_CHUNK];
            let read = self.stream.read(&mut buf);
            let n = match self.read_timeout {
                Some(limit) => tokio::time::timeout(limit, read)
                    .await
                    .unwrap_or_else(|_| Err(timed_out("read"))),
                None => read.await,
            }
            .map_err(|e| self.fail(e.into()))?;

            if n == 0 {
                return Err(self.fail(Error::ConnectionClosed));
            }
            self.decoder.append(&buf[..n]);
        }
    }

    /// Sends one request and returns its reply, turning error replies into
    /// errors ([`Error::Moved`], [`Error::Ask`], [`Error::Server`], ...).
    pub async fn execute(&mut self, cmd: &Cmd) -> Result<Frame> {
        self.send(cmd);
        self.flush().await?;
        into_result(self.receive().await?)
    }

    /// Like [`execute`](Connection::execute), decoding the reply as `T`.
    pub async fn query<T: FromFrame>(&mut self, cmd: &Cmd) -> Result<T> {
        T::from_frame(self.execute(cmd).await?)
    }

    /// Sends ASKING, allowing the next command to address a slot that is
    /// being imported by this node.
    pub async fn asking(&mut self) -> Result<()> {
        self.query(&command::asking()).await
    }

    /// Liveness check.
    pub async fn ping(&mut self) -> Result<()> {
        let reply = self.execute(&command::ping()).await?;
        if reply.is_status("PONG") {
            Ok(())
        } else {
            Err(Error::unexpected("PONG", reply.kind()))
        }
    }

    /// Shuts the connection down.
    pub async fn close(mut self) -> Result<()> {
        self.broken = true;
        Ok(self.stream.shutdown().await?)
    }

    fn fail(&mut self, error: Error) -> Error {
        self.broken = true;
        debug!(address = %self.address, error = %error, "connection marked broken");
        error
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("address", &self.address)
            .field("read_timeout", &self.read_timeout)
            .field("write_timeout", &self.write_timeout)
            .field("in_flight", &self.in_flight)
            .field("broken", &self.broken)
            .finish()
    }
}

/// Turns an error reply into the matching error.
pub fn into_result(frame: Frame) -> Result<Frame> {
    match frame {
        Frame::Error(message) => Err(Error::from_reply(&message)),
        other => Ok(other),
    }
}

fn timed_out(op: &str) -> io::Error {
    io::Error::new(io::ErrorKind::TimedOut, format!("{} timed out", op))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockNode;

    #[tokio::test]
    async fn test_execute_round_trip() {
        let node = MockNode::start(|cmd| match cmd[0].as_str() {
            "GET" => Frame::bulk("value"),
            _ => Frame::simple("OK"),
        })
        .await;

        let mut conn = Connection::open(node.address(), &ClientConfig::default())
            .await
            .unwrap();
        let value: Option<String> = conn.query(&command::get("key")).await.unwrap();
        assert_eq!(value.as_deref(), Some("value"));
        assert!(!conn.is_broken());
    }

    #[tokio::test]
    async fn test_handshake_sends_auth_select_setname() {
        let node = MockNode::start(|_| Frame::simple("OK")).await;
        let config = ClientConfig {
            password: Some("secret".into()),
            database: Some(2),
            client_name: Some("worker".into()),
            ..ClientConfig::default()
        };

        Connection::open(node.address(), &config).await.unwrap();
        let seen = node.commands();
        assert_eq!(seen[0], vec!["AUTH", "secret"]);
        assert_eq!(seen[1], vec!["SELECT", "2"]);
        assert_eq!(seen[2], vec!["CLIENT", "SETNAME", "worker"]);
    }

    #[tokio::test]
    async fn test_rejected_auth_is_auth_error() {
        let node = MockNode::start(|_| Frame::error("WRONGPASS invalid password")).await;
        let config = ClientConfig {
            password: Some("bad".into()),
            ..ClientConfig::default()
        };
        let err = Connection::open(node.address(), &config).await.unwrap_err();
        assert!(matches!(err, Error::Auth));
    }

    #[tokio::test]
    async fn test_renamed_command_on_wire() {
        let node = MockNode::start(|_| Frame::BulkString(None)).await;
        let mut renames = CommandRenames::new();
        renames.rename(command::Command::Get, "FETCH");
        let config = ClientConfig {
            renames: Arc::new(renames),
            ..ClientConfig::default()
        };
        let mut conn = Connection::open(node.address(), &config).await.unwrap();
        let _: Option<String> = conn.query(&command::get("k")).await.unwrap();
        assert_eq!(node.commands()[0], vec!["FETCH", "k"]);
    }

    #[tokio::test]
    async fn test_error_reply_is_typed() {
        let node = MockNode::start(|_| Frame::error("MOVED 7 127.0.0.1:7001")).await;
        let mut conn = Connection::open(node.address(), &ClientConfig::default())
            .await
            .unwrap();
        let err = conn.execute(&command::get("k")).await.unwrap_err();
        assert!(matches!(err, Error::Moved { slot: 7, .. }));
        // a redirect is not a transport failure
        assert!(!conn.is_broken());
    }

    #[tokio::test]
    async fn test_peer_close_marks_broken() {
        let node = MockNode::start(|_| Frame::simple("OK")).await;
        let mut conn = Connection::open(node.address(), &ClientConfig::default())
            .await
            .unwrap();
        node.disconnect_all();
        let err = conn.ping().await.unwrap_err();
        assert!(err.is_connection_error());
        assert!(conn.is_broken());
    }

    #[tokio::test]
    async fn test_read_timeout_marks_broken() {
        let node = MockNode::silent().await;
        let config = ClientConfig {
            read_timeout: Some(Duration::from_millis(20)),
            ..ClientConfig::default()
        };
        let mut conn = Connection::open(node.address(), &config).await.unwrap();
        let err = conn.ping().await.unwrap_err();
        assert!(matches!(err, Error::Io { ref source } if source.kind() == io::ErrorKind::TimedOut));
        assert!(conn.is_broken());
    }

    #[tokio::test]
    async fn test_in_flight_tracks_unread_replies() {
        let node = MockNode::start(|_| Frame::simple("OK")).await;
        let mut conn = Connection::open(node.address(), &ClientConfig::default())
            .await
            .unwrap();
        assert!(conn.is_in_sync());

        conn.send(&command::ping());
        conn.send(&command::ping());
        assert!(!conn.is_in_sync());
        conn.flush().await.unwrap();
        assert_eq!(conn.in_flight(), 2);

        conn.receive().await.unwrap();
        assert_eq!(conn.in_flight(), 1);
        conn.receive().await.unwrap();
        assert!(conn.is_in_sync());
    }

    #[tokio::test]
    async fn test_connect_refused_is_connection_error() {
        let address = crate::mock::unused_address().await;
        let err = Connection::open(&address, &ClientConfig::default())
            .await
            .unwrap_err();
        assert!(err.is_connection_error());
    }
}
