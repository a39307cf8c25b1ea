//! Open Sound Control transport.
//!
//! Queries go out as `/query` messages carrying the JSON payload as a single string
//! argument. The service answers with `/info`, `/data` or `/error` messages sent back
//! to the local port the backend listens on.

use serde_json::Value;
use std::{
    io::ErrorKind,
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread::JoinHandle,
    time::Duration,
};

use crate::{
    callbacks::Callbacks,
    config::ClientConfig,
    dispatch::{DispatchBridge, InferenceEvent},
    error::ClientError,
    query::{ImageFormat, InferenceBackend, QueryDefaults, RawImage, image_payload},
};

const MAX_PACKET_SIZE: usize = 65_507;
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Sent once when the backend starts.
pub const CONNECT_ADDRESS: &str = "/server.connect";
/// Sent once when the backend stops.
pub const DISCONNECT_ADDRESS: &str = "/server.disconnect";
/// Carries each query as a JSON string argument.
pub const QUERY_ADDRESS: &str = "/query";

/// An OSC argument, limited to the types the inference service exchanges.
#[derive(Clone, Debug, PartialEq)]
pub enum OscArg {
    /// `i`: big-endian 32-bit integer.
    Int(i32),
    /// `f`: big-endian 32-bit float.
    Float(f32),
    /// `s`: null-terminated string padded to four bytes.
    Str(String),
}

impl OscArg {
    fn tag(&self) -> u8 {
        match self {
            OscArg::Int(_) => b'i',
            OscArg::Float(_) => b'f',
            OscArg::Str(_) => b's',
        }
    }
}

/// A single OSC 1.0 message. Bundles are not supported.
#[derive(Clone, Debug, PartialEq)]
pub struct OscMessage {
    /// Address pattern, always starting with `/`.
    pub address: String,
    /// Arguments in the order of the type tag string.
    pub args: Vec<OscArg>,
}

impl OscMessage {
    /// Creates a message without arguments.
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            args: Vec::new(),
        }
    }

    /// Appends an argument.
    pub fn with_arg(mut self, arg: OscArg) -> Self {
        self.args.push(arg);
        self
    }

    /// Serializes the message into a single UDP datagram.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        write_padded(&mut buf, self.address.as_bytes());

        let mut tags = vec![b','];
        tags.extend(self.args.iter().map(OscArg::tag));
        write_padded(&mut buf, &tags);

        for arg in &self.args {
            match arg {
                OscArg::Int(value) => buf.extend_from_slice(&value.to_be_bytes()),
                OscArg::Float(value) => buf.extend_from_slice(&value.to_be_bytes()),
                OscArg::Str(value) => write_padded(&mut buf, value.as_bytes()),
            }
        }
        buf
    }

    /// Parses a datagram, rejecting bundles, truncated packets and unknown type tags.
    pub fn decode(packet: &[u8]) -> Result<Self, ClientError> {
        let mut pos = 0;
        let address = read_padded(packet, &mut pos)?;
        if address == "#bundle" {
            return Err(ClientError::Osc("bundles are not supported"));
        }
        if !address.starts_with('/') {
            return Err(ClientError::Osc("address must start with '/'"));
        }

        // type tags are optional in old implementations
        if pos == packet.len() {
            return Ok(Self::new(address));
        }
        let tags = read_padded(packet, &mut pos)?;
        let Some(tags) = tags.strip_prefix(',') else {
            return Err(ClientError::Osc("type tag string must start with ','"));
        };

        let mut args = Vec::with_capacity(tags.len());
        for tag in tags.bytes() {
            let arg = match tag {
                b'i' => OscArg::Int(i32::from_be_bytes(read_word(packet, &mut pos)?)),
                b'f' => OscArg::Float(f32::from_be_bytes(read_word(packet, &mut pos)?)),
                b's' => OscArg::Str(read_padded(packet, &mut pos)?),
                _ => return Err(ClientError::Osc("unsupported argument type")),
            };
            args.push(arg);
        }
        Ok(Self { address, args })
    }

    fn first_str(&self) -> Option<&str> {
        self.args.iter().find_map(|arg| match arg {
            OscArg::Str(value) => Some(value.as_str()),
            _ => None,
        })
    }
}

fn write_padded(buf: &mut Vec<u8>, bytes: &[u8]) {
    buf.extend_from_slice(bytes);
    buf.push(0);
    while buf.len() % 4 != 0 {
        buf.push(0);
    }
}

fn read_padded(packet: &[u8], pos: &mut usize) -> Result<String, ClientError> {
    let rest = packet
        .get(*pos..)
        .ok_or(ClientError::Osc("unexpected end of packet"))?;
    let len = rest
        .iter()
        .position(|b| *b == 0)
        .ok_or(ClientError::Osc("unterminated string"))?;
    let value = std::str::from_utf8(&rest[..len])
        .map_err(|_| ClientError::Osc("string is not valid UTF-8"))?
        .to_string();
    let next = *pos + (len + 4) / 4 * 4;
    if next > packet.len() {
        return Err(ClientError::Osc("string padding exceeds packet"));
    }
    *pos = next;
    Ok(value)
}

fn read_word(packet: &[u8], pos: &mut usize) -> Result<[u8; 4], ClientError> {
    let word = packet
        .get(*pos..*pos + 4)
        .and_then(|bytes| <[u8; 4]>::try_from(bytes).ok())
        .ok_or(ClientError::Osc("unexpected end of packet"))?;
    *pos += 4;
    Ok(word)
}

/// Maps an inbound message to an event, or `None` for addresses the client ignores.
pub fn classify(message: &OscMessage) -> Option<InferenceEvent> {
    let parse_json = |label: &str| -> Result<Value, String> {
        let text = message
            .first_str()
            .ok_or_else(|| format!("{label} message carries no payload"))?;
        serde_json::from_str(text).map_err(|err| format!("malformed {label} payload: {err}"))
    };

    match message.address.as_str() {
        "/info" => Some(match parse_json("/info") {
            Ok(info) => InferenceEvent::Info(info),
            Err(reason) => InferenceEvent::Error(reason),
        }),
        "/data" => Some(match parse_json("/data") {
            Ok(data) => InferenceEvent::Data(data),
            Err(reason) => InferenceEvent::Error(reason),
        }),
        "/error" => Some(InferenceEvent::Error(
            message.first_str().unwrap_or("unknown error").to_string(),
        )),
        other => {
            log::debug!("Ignoring OSC message for {other}");
            None
        }
    }
}

/// Talks to an inference service over OSC/UDP.
pub struct OscBackend {
    socket: UdpSocket,
    target: SocketAddr,
    bridge: Arc<DispatchBridge>,
    defaults: QueryDefaults,
    running: Arc<AtomicBool>,
    listener: Option<JoinHandle<()>>,
}

impl OscBackend {
    /// Binds `local_port` for replies, starts the listener and announces the client.
    ///
    /// Pass `0` as `local_port` to let the OS choose; see [`OscBackend::local_addr`].
    pub fn new(
        config: &ClientConfig,
        local_port: u16,
        callbacks: Callbacks,
    ) -> Result<Self, ClientError> {
        let endpoint = config.endpoint()?;
        let target = endpoint.socket_addr()?;
        let bind_ip: IpAddr = match (target.is_ipv4(), target.ip().is_loopback()) {
            (true, true) => Ipv4Addr::LOCALHOST.into(),
            (true, false) => Ipv4Addr::UNSPECIFIED.into(),
            (false, true) => Ipv6Addr::LOCALHOST.into(),
            (false, false) => Ipv6Addr::UNSPECIFIED.into(),
        };

        let socket = UdpSocket::bind((bind_ip, local_port))?;
        let recv_socket = socket.try_clone()?;
        recv_socket.set_read_timeout(Some(POLL_INTERVAL))?;

        let bridge = Arc::new(DispatchBridge::new(callbacks));
        let running = Arc::new(AtomicBool::new(true));

        let listener = std::thread::Builder::new()
            .name("infernum-osc".to_string())
            .spawn({
                let bridge = bridge.clone();
                let running = running.clone();
                move || listen(recv_socket, bridge, running)
            })?;

        let backend = Self {
            socket,
            target,
            bridge,
            defaults: config.defaults.clone(),
            running,
            listener: Some(listener),
        };
        backend.send(&OscMessage::new(CONNECT_ADDRESS));
        log::debug!("OSC backend started for {endpoint}");
        Ok(backend)
    }

    /// The bridge delivering this backend's events to the host callbacks.
    pub fn bridge(&self) -> &Arc<DispatchBridge> {
        &self.bridge
    }

    /// Address the listener receives replies on.
    pub fn local_addr(&self) -> Result<SocketAddr, ClientError> {
        Ok(self.socket.local_addr()?)
    }

    /// Announces the disconnect and stops the listener thread.
    ///
    /// From a host callback the listener is only detached; it exits after the
    /// callback returns.
    pub fn stop(&mut self) {
        if let Some(handle) = self.listener.take() {
            self.send(&OscMessage::new(DISCONNECT_ADDRESS));
            self.running.store(false, Ordering::SeqCst);
            if handle.thread().id() != std::thread::current().id() {
                let _ = handle.join();
            }
        }
    }

    fn send(&self, message: &OscMessage) {
        if let Err(err) = self.socket.send_to(&message.encode(), self.target) {
            self.bridge
                .dispatch(InferenceEvent::Error(ClientError::Io(err).to_string()));
        }
    }
}

impl InferenceBackend for OscBackend {
    fn query_image(&self, image: &RawImage<'_>) {
        self.query_image_as(image, self.defaults.format, &self.defaults.key);
    }

    fn query_image_as(&self, image: &RawImage<'_>, format: ImageFormat, key: &str) {
        match image_payload(image, format, key) {
            Ok(payload) => self.query_json(&payload),
            Err(err) => self.bridge.dispatch(InferenceEvent::Error(err.to_string())),
        }
    }

    fn query_json(&self, payload: &Value) {
        let message = OscMessage::new(QUERY_ADDRESS).with_arg(OscArg::Str(payload.to_string()));
        self.send(&message);
    }
}

impl Drop for OscBackend {
    fn drop(&mut self) {
        self.stop();
    }
}

fn listen(socket: UdpSocket, bridge: Arc<DispatchBridge>, running: Arc<AtomicBool>) {
    let mut buf = vec![0u8; MAX_PACKET_SIZE];
    while running.load(Ordering::SeqCst) {
        match socket.recv_from(&mut buf) {
            Ok((len, from)) => match OscMessage::decode(&buf[..len]) {
                Ok(message) => {
                    if let Some(event) = classify(&message) {
                        bridge.dispatch(event);
                    }
                }
                Err(err) => {
                    log::warn!("Dropping OSC packet from {from}: {err}");
                    bridge.dispatch(InferenceEvent::Error(err.to_string()));
                }
            },
            Err(err) if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {}
            // ICMP port unreachable surfaces here on some platforms
            Err(err) if err.kind() == ErrorKind::ConnectionReset => {
                log::debug!("OSC peer is not listening: {err}");
            }
            Err(err) => {
                log::error!("OSC listener failed: {err}");
                bridge.dispatch(InferenceEvent::Error(ClientError::Io(err).to_string()));
                break;
            }
        }
    }
    log::debug!("OSC listener stopped");
}
