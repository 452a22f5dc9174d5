//! Loopback control channel between the supervisor and its child.
//!
//! The channel listens on a loopback port, admits exactly one connection and
//! stops listening as soon as it has one. The first message on a connection
//! must be a KEY matching the key minted for the current launch; anything
//! else sent before that is dropped.

pub mod codec;

pub use self::codec::{linearize_properties, ControlMessage, LogLevel, MessageCode};
use crate::configs::ControlConfig;
use async_trait::async_trait;
use color_eyre::eyre::{bail, WrapErr};
use color_eyre::Result;
use rand::Rng;
use std::fmt;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, instrument, warn, Instrument};

const KEY_CHARS: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ_-";

/// Per-launch token the child has to present before it is trusted.
#[derive(Clone, PartialEq, Eq)]
pub struct AuthKey(String);

impl AuthKey {
    pub const LEN: usize = 16;

    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        let key = (0..Self::LEN)
            .map(|_| KEY_CHARS[rng.gen_range(0..KEY_CHARS.len())] as char)
            .collect();
        Self(key)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for AuthKey {
    fn from(key: &str) -> Self {
        Self(key.to_string())
    }
}

impl fmt::Debug for AuthKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AuthKey(..)")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// The connected peer presented the expected key.
    Authenticated,
    Message(ControlMessage),
}

#[derive(Debug, Default)]
pub struct Polled {
    pub events: Vec<ChannelEvent>,
    /// The read budget ran out with data possibly still waiting.
    pub more: bool,
}

#[async_trait]
pub trait ControlTransport: Send {
    /// Makes sure a listener is up and returns its port.
    async fn listen(&mut self) -> Result<u16>;

    async fn stop_listening(&mut self);

    fn port(&self) -> Option<u16>;

    fn is_connected(&self) -> bool;

    /// Key the next KEY message is checked against. `None` rejects everyone.
    fn expect_key(&mut self, key: Option<AuthKey>);

    /// Accepts a pending connection and reads what arrived, for at most
    /// `budget`.
    async fn poll_incoming(&mut self, budget: Duration) -> Polled;

    async fn send(&mut self, message: ControlMessage) -> Result<()>;

    async fn close(&mut self);
}

/// Shared write side of the current connection. Sends are serialized, and a
/// failed send drops the connection.
#[derive(Debug, Clone, Default)]
pub struct ControlSender {
    writer: Arc<Mutex<Option<OwnedWriteHalf>>>,
}

impl ControlSender {
    pub async fn send(&self, message: ControlMessage) -> Result<()> {
        let frame = message.encode()?;
        let mut writer = self.writer.lock().await;
        let Some(stream) = writer.as_mut() else {
            bail!("Control channel is not connected, {} not sent", message.code);
        };
        let written = match stream.write_all(&frame).await {
            Ok(()) => stream.flush().await,
            Err(err) => Err(err),
        };
        if let Err(err) = written {
            *writer = None;
            return Err(err).wrap_err_with(|| format!("Failed to send {}", message.code));
        }
        Ok(())
    }

    async fn attach(&self, stream: OwnedWriteHalf) {
        *self.writer.lock().await = Some(stream);
    }

    async fn detach(&self) {
        if let Some(mut stream) = self.writer.lock().await.take() {
            let _ = stream.shutdown().await;
        }
    }
}

struct Listener {
    port: u16,
    accepted: oneshot::Receiver<(TcpStream, SocketAddr)>,
    task: JoinHandle<()>,
}

struct Connection {
    peer: SocketAddr,
    frames: UnboundedReceiver<ControlMessage>,
    reader: JoinHandle<()>,
    authenticated: bool,
}

pub struct ControlChannel {
    config: ControlConfig,
    listener: Option<Listener>,
    connection: Option<Connection>,
    sender: ControlSender,
    expected_key: Option<AuthKey>,
    last_port: Option<u16>,
}

impl ControlChannel {
    pub fn new(config: ControlConfig) -> Self {
        Self {
            config,
            listener: None,
            connection: None,
            sender: ControlSender::default(),
            expected_key: None,
            last_port: None,
        }
    }

    #[cfg(test)]
    pub fn sender(&self) -> ControlSender {
        self.sender.clone()
    }

    /// Tries the previous port, then the fixed port, then the range.
    fn bind(&self) -> Result<(TcpListener, u16)> {
        let preferred = self
            .last_port
            .into_iter()
            .chain(Some(self.config.port).filter(|p| *p != 0));
        for port in preferred {
            match bind_loopback(port) {
                Ok(bound) => return Ok(bound),
                Err(err) => debug!(port, ?err, "Unable to bind preferred port"),
            }
        }

        let (min, max) = (self.config.port_min, self.config.port_max);
        if min == 0 {
            return bind_loopback(0).wrap_err("Failed to bind an ephemeral port");
        }
        for port in min..=max {
            match bind_loopback(port) {
                Ok(bound) => return Ok(bound),
                Err(err) if err.kind() == ErrorKind::AddrInUse => continue,
                Err(err) => {
                    return Err(err).wrap_err_with(|| format!("Failed to bind port {port}"))
                }
            }
        }
        bail!("No free port in {min}..={max}")
    }

    async fn open(&mut self, stream: TcpStream, peer: SocketAddr) {
        if let Err(err) = stream.set_nodelay(true) {
            debug!(?err, "Failed to set TCP_NODELAY");
        }
        let (read, write) = stream.into_split();
        self.sender.attach(write).await;
        let (sender, frames) = mpsc::unbounded_channel();
        let reader = tokio::spawn(
            async move {
                let mut read = BufReader::new(read);
                loop {
                    match codec::read_frame(&mut read).await {
                        Ok(Some(message)) => {
                            if sender.send(message).is_err() {
                                break;
                            }
                        }
                        Ok(None) => break,
                        Err(err) => {
                            debug!(?err, "Control read failed");
                            break;
                        }
                    }
                }
                debug!("Control reader finished");
            }
            .instrument(info_span!("control_read", %peer)),
        );
        debug!(%peer, "Control connection accepted");
        self.connection = Some(Connection {
            peer,
            frames,
            reader,
            authenticated: false,
        });
    }

    async fn on_message(&mut self, message: ControlMessage) -> Option<ChannelEvent> {
        let connection = self.connection.as_mut()?;
        if message.code == MessageCode::Key {
            let valid = matches!(&self.expected_key, Some(key) if key.as_str() == message.payload);
            if valid {
                connection.authenticated = true;
                debug!(peer = %connection.peer, "Child authenticated");
                return Some(ChannelEvent::Authenticated);
            }
            error!("Received a connection request with an incorrect key. Waiting for another connection.");
            let reply = ControlMessage::new(MessageCode::BadKey, "Incorrect key.  Connection rejected.");
            if let Err(err) = self.sender.send(reply).await {
                debug!(?err, "Failed to send BADKEY");
            }
            self.close().await;
            self.relisten().await;
            return None;
        }
        if !connection.authenticated {
            warn!(code = %message.code, "Ignoring message from an unauthenticated connection");
            return None;
        }
        Some(ChannelEvent::Message(message))
    }

    /// Opens the listener again while a child is still expected to connect.
    async fn relisten(&mut self) {
        if self.expected_key.is_none() {
            return;
        }
        if let Err(err) = self.listen().await {
            warn!(?err, "Failed to listen for the child again");
        }
    }
}

#[async_trait]
impl ControlTransport for ControlChannel {
    #[instrument(skip(self))]
    async fn listen(&mut self) -> Result<u16> {
        if let Some(listener) = &self.listener {
            return Ok(listener.port);
        }
        if self.connection.is_some() {
            self.close().await;
        }
        let (listener, port) = self.bind()?;
        let (accepted_sender, accepted) = oneshot::channel();
        let task = tokio::spawn(
            async move {
                match listener.accept().await {
                    Ok(pair) => {
                        let _ = accepted_sender.send(pair);
                    }
                    Err(err) => warn!(?err, "Failed to accept control connection"),
                }
            }
            .instrument(info_span!("control_accept", port)),
        );
        self.last_port = Some(port);
        self.listener = Some(Listener {
            port,
            accepted,
            task,
        });
        info!(port, "Waiting for the child to connect");
        Ok(port)
    }

    async fn stop_listening(&mut self) {
        if let Some(listener) = self.listener.take() {
            listener.task.abort();
            debug!(port = listener.port, "Stopped listening");
        }
    }

    fn port(&self) -> Option<u16> {
        self.listener.as_ref().map(|l| l.port).or(self.last_port)
    }

    fn is_connected(&self) -> bool {
        self.connection.is_some()
    }

    fn expect_key(&mut self, key: Option<AuthKey>) {
        self.expected_key = key;
    }

    async fn poll_incoming(&mut self, budget: Duration) -> Polled {
        let started = Instant::now();
        let mut polled = Polled::default();

        if self.connection.is_none() {
            let Some(listener) = self.listener.as_mut() else {
                return polled;
            };
            match listener.accepted.try_recv() {
                Ok((stream, peer)) => {
                    self.listener = None;
                    self.open(stream, peer).await;
                }
                Err(oneshot::error::TryRecvError::Empty) => return polled,
                Err(oneshot::error::TryRecvError::Closed) => {
                    self.listener = None;
                    self.relisten().await;
                    return polled;
                }
            }
        }

        loop {
            let Some(connection) = self.connection.as_mut() else {
                break;
            };
            match connection.frames.try_recv() {
                Ok(message) => {
                    if let Some(event) = self.on_message(message).await {
                        polled.events.push(event);
                    }
                }
                Err(mpsc::error::TryRecvError::Empty) => break,
                Err(mpsc::error::TryRecvError::Disconnected) => {
                    debug!("Control connection closed by the child");
                    self.close().await;
                    self.relisten().await;
                    break;
                }
            }
            if started.elapsed() >= budget {
                polled.more = true;
                break;
            }
        }
        polled
    }

    async fn send(&mut self, message: ControlMessage) -> Result<()> {
        let result = self.sender.send(message).await;
        if result.is_err() && self.connection.is_some() {
            self.close().await;
        }
        result
    }

    async fn close(&mut self) {
        self.sender.detach().await;
        if let Some(connection) = self.connection.take() {
            connection.reader.abort();
            debug!(peer = %connection.peer, "Control connection closed");
        }
    }
}

impl Drop for ControlChannel {
    fn drop(&mut self) {
        if let Some(listener) = self.listener.take() {
            listener.task.abort();
        }
        if let Some(connection) = self.connection.take() {
            connection.reader.abort();
        }
    }
}

fn bind_loopback(port: u16) -> std::io::Result<(TcpListener, u16)> {
    let listener = std::net::TcpListener::bind(("127.0.0.1", port))?;
    listener.set_nonblocking(true)?;
    let listener = TcpListener::from_std(listener)?;
    let port = listener.local_addr()?.port();
    Ok((listener, port))
}
