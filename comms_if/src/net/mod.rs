//! # Network Module
//!
//! Networking over ZMQ. Every socket used by the executables is a [`MonitoredSocket`], which
//! watches the socket's connection events in a background thread so that callers can see how many
//! peers are attached without touching the socket itself.

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use log::{debug, warn};
use serde::Deserialize;
use std::{
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    thread,
};
use zmq::{Context, Socket, SocketEvent, SocketType};

// Export zmq
pub use zmq;

// ------------------------------------------------------------------------------------------------
// MACROS
// ------------------------------------------------------------------------------------------------

macro_rules! set_sockopts {
    ($socket:expr, $(($opt:ident, $val:expr)),+) => {
        $(
            $socket.$opt($val)
                .map_err(|e| MonitoredSocketError::SocketOptionError(stringify!($opt).into(), e))?;
        )+
    };
}

// ------------------------------------------------------------------------------------------------
// STATICS
// ------------------------------------------------------------------------------------------------

/// Number of monitors created so far, gives each monitor a unique inproc endpoint.
static NUM_MONITORS: AtomicUsize = AtomicUsize::new(0);

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

/// Network parameters shared by the executables and the test clients.
#[derive(Debug, Clone, Deserialize)]
pub struct NetParams {
    /// Endpoint the simulator bridge connects to, for example `"tcp://*:4567"` on the server
    /// side.
    pub sim_endpoint: String,

    /// Maximum time a single receive on the simulator socket will block for.
    ///
    /// Units: milliseconds
    #[serde(default = "default_recv_timeout_ms")]
    pub recv_timeout_ms: i32,

    /// Time after which a client that has sent nothing is considered disconnected.
    ///
    /// Units: seconds
    #[serde(default = "default_client_timeout_s")]
    pub client_timeout_s: f64,
}

/// A zmq socket with a monitor thread counting its connected peers.
///
/// The count is kept up to date from the socket's `ACCEPTED`, `CONNECTED` and `DISCONNECTED`
/// events. Events are delivered asynchronously so the count may briefly lag the socket.
pub struct MonitoredSocket {
    socket: Socket,

    shutdown: Arc<AtomicBool>,

    peers: Arc<AtomicUsize>,
}

/// Options applied to a [`MonitoredSocket`] when it is created.
///
/// Options with a `ZMQ_` name map directly onto
/// [`zmq_setsockopt`](http://api.zeromq.org/4-2:zmq-setsockopt).
pub struct SocketOptions {
    /// Bind to the endpoint instead of connecting to it. Servers bind, clients connect.
    ///
    /// Default: `false`
    pub bind: bool,

    /// Block in [`MonitoredSocket::new`] until the first connection is made, returning
    /// `MonitoredSocketError::CouldNotConnect` if it can't be. Only useful for clients.
    ///
    /// Default: `true`
    pub block_on_first_connect: bool,

    /// `ZMQ_LINGER` in milliseconds
    pub linger: i32,

    /// `ZMQ_CONNECT_TIMEOUT` in milliseconds
    pub connect_timeout: i32,

    /// `ZMQ_RCVTIMEO` in milliseconds, `-1` blocks forever
    pub recv_timeout: i32,

    /// `ZMQ_SNDTIMEO` in milliseconds, `-1` blocks forever
    pub send_timeout: i32,

    /// `ZMQ_HEARTBEAT_IVL` in milliseconds
    pub heartbeat_ivl: i32,

    /// `ZMQ_HEARTBEAT_TIMEOUT` in milliseconds
    pub heartbeat_timeout: i32,

    /// `ZMQ_HEARTBEAT_TTL` in milliseconds
    pub heartbeat_ttl: i32,

    /// `ZMQ_ROUTER_MANDATORY`, only applied to ROUTER sockets. Sends to an unknown identity fail
    /// with `EHOSTUNREACH` instead of being silently dropped.
    pub router_mandatory: bool,
}

// ------------------------------------------------------------------------------------------------
// ENUMS
// ------------------------------------------------------------------------------------------------

#[derive(thiserror::Error, Debug)]
pub enum MonitoredSocketError {
    #[error("Error creating the socket: {0}")]
    CreateSocketError(zmq::Error),

    #[error("Error enabling monitoring for the socket: {0}")]
    MonitoringEnableError(zmq::Error),

    #[error("Could not connect the socket: {0:?}")]
    CouldNotConnect(Option<zmq::Error>),

    #[error("Could not read event from monitor socket: {0}")]
    EventReadError(zmq::Error),

    #[error("Could not set the {0} socket option: {1}")]
    SocketOptionError(String, zmq::Error),
}

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl MonitoredSocket {
    /// Create, configure and connect (or bind) a new monitored socket.
    ///
    /// - `ctx`: context the socket and its monitor are created in
    /// - `socket_type`: zmq socket type
    /// - `socket_options`: see [`SocketOptions`]
    /// - `endpoint`: zmq endpoint, such as `"tcp://localhost:4567"`
    pub fn new(
        ctx: &Context,
        socket_type: SocketType,
        socket_options: SocketOptions,
        endpoint: &str,
    ) -> Result<Self, MonitoredSocketError> {
        let socket = ctx
            .socket(socket_type)
            .map_err(MonitoredSocketError::CreateSocketError)?;

        // The monitor is a PAIR socket connected to an inproc endpoint unique to this socket
        let monitor_endpoint = format!(
            "inproc://monitor_{}",
            NUM_MONITORS.fetch_add(1, Ordering::Relaxed)
        );
        socket
            .monitor(&monitor_endpoint, SocketEvent::ALL as i32)
            .map_err(MonitoredSocketError::MonitoringEnableError)?;
        let monitor = ctx
            .socket(zmq::PAIR)
            .map_err(MonitoredSocketError::CreateSocketError)?;
        monitor
            .connect(&monitor_endpoint)
            .map_err(|e| MonitoredSocketError::CouldNotConnect(Some(e)))?;

        socket_options.set(&socket)?;

        let attach = if socket_options.bind {
            socket.bind(endpoint)
        } else {
            socket.connect(endpoint)
        };
        attach.map_err(|e| MonitoredSocketError::CouldNotConnect(Some(e)))?;

        let peers = Arc::new(AtomicUsize::new(0));

        if socket_options.block_on_first_connect {
            loop {
                match read_event(&monitor).map_err(MonitoredSocketError::EventReadError)? {
                    SocketEvent::CONNECTED => break,
                    SocketEvent::CONNECT_DELAYED => continue,
                    _ => return Err(MonitoredSocketError::CouldNotConnect(None)),
                }
            }

            peers.store(1, Ordering::Relaxed);
        }

        let shutdown = Arc::new(AtomicBool::new(false));

        // The thread blocks on the next event so it is detached rather than joined, it exits on
        // the first event after shutdown or when the context is terminated.
        {
            let shutdown = shutdown.clone();
            let peers = peers.clone();
            thread::spawn(move || monitor_socket(monitor, monitor_endpoint, shutdown, peers));
        }

        Ok(Self {
            socket,
            shutdown,
            peers,
        })
    }

    /// Number of peers currently connected to the socket.
    pub fn num_peers(&self) -> usize {
        self.peers.load(Ordering::Relaxed)
    }

    /// True if at least one peer is connected.
    pub fn connected(&self) -> bool {
        self.num_peers() > 0
    }
}

impl Drop for MonitoredSocket {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }
}

impl std::ops::Deref for MonitoredSocket {
    type Target = Socket;

    fn deref(&self) -> &Self::Target {
        &self.socket
    }
}

impl std::ops::DerefMut for MonitoredSocket {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.socket
    }
}

impl SocketOptions {
    /// Apply these options to the given socket.
    pub fn set(&self, socket: &Socket) -> Result<(), MonitoredSocketError> {
        set_sockopts!(
            socket,
            (set_connect_timeout, self.connect_timeout),
            (set_heartbeat_ivl, self.heartbeat_ivl),
            (set_heartbeat_timeout, self.heartbeat_timeout),
            (set_heartbeat_ttl, self.heartbeat_ttl),
            (set_linger, self.linger),
            (set_rcvtimeo, self.recv_timeout),
            (set_sndtimeo, self.send_timeout)
        );

        if let Ok(SocketType::ROUTER) = socket.get_socket_type() {
            set_sockopts!(socket, (set_router_mandatory, self.router_mandatory));
        }

        Ok(())
    }
}

impl Default for SocketOptions {
    /// zmq's own defaults, except that `bind` is off and `block_on_first_connect` is on.
    fn default() -> Self {
        Self {
            bind: false,
            block_on_first_connect: true,
            connect_timeout: 0,
            heartbeat_ivl: 0,
            heartbeat_timeout: 0,
            heartbeat_ttl: 0,
            linger: 30_000,
            recv_timeout: -1,
            send_timeout: -1,
            router_mandatory: false,
        }
    }
}

// ------------------------------------------------------------------------------------------------
// PRIVATE FUNCTIONS
// ------------------------------------------------------------------------------------------------

fn default_recv_timeout_ms() -> i32 {
    100
}

fn default_client_timeout_s() -> f64 {
    5.0
}

/// Read an event from a monitor socket.
fn read_event(socket: &Socket) -> Result<SocketEvent, zmq::Error> {
    let msg = socket.recv_msg(0)?;

    let event = u16::from_ne_bytes([msg[0], msg[1]]);

    // Discard the endpoint address frame
    if socket.get_rcvmore()? {
        socket.recv_msg(0)?;
    }

    Ok(SocketEvent::from_raw(event))
}

fn monitor_socket(
    monitor: Socket,
    monitor_endpoint: String,
    shutdown: Arc<AtomicBool>,
    peers: Arc<AtomicUsize>,
) {
    while !shutdown.load(Ordering::Relaxed) {
        let event = match read_event(&monitor) {
            Ok(e) => e,
            Err(e) => {
                warn!("Monitor {} stopped: {}", monitor_endpoint, e);
                break;
            }
        };

        update_peers(&peers, event);
    }

    debug!("Monitor {} exited", monitor_endpoint);
}

/// Update the peer count from a socket event.
fn update_peers(peers: &AtomicUsize, event: SocketEvent) {
    match event {
        SocketEvent::ACCEPTED | SocketEvent::CONNECTED => {
            peers.fetch_add(1, Ordering::Relaxed);
        }
        SocketEvent::DISCONNECTED => {
            // Never below zero, a blocking connect may already have counted the peer
            let _ = peers.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
        }
        _ => (),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_net_params_defaults() {
        let params: NetParams =
            serde_json::from_str(r#"{"sim_endpoint": "tcp://*:4567"}"#).unwrap();

        assert_eq!(params.sim_endpoint, "tcp://*:4567");
        assert_eq!(params.recv_timeout_ms, 100);
        assert_eq!(params.client_timeout_s, 5.0);
    }

    #[test]
    fn test_peer_count() {
        let peers = AtomicUsize::new(0);

        update_peers(&peers, SocketEvent::ACCEPTED);
        update_peers(&peers, SocketEvent::ACCEPTED);
        update_peers(&peers, SocketEvent::LISTENING);
        assert_eq!(peers.load(Ordering::Relaxed), 2);

        update_peers(&peers, SocketEvent::DISCONNECTED);
        update_peers(&peers, SocketEvent::DISCONNECTED);
        update_peers(&peers, SocketEvent::DISCONNECTED);
        assert_eq!(peers.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_peers_seen_by_bound_socket() {
        let ctx = zmq::Context::new();

        let server = MonitoredSocket::new(
            &ctx,
            zmq::ROUTER,
            SocketOptions {
                bind: true,
                block_on_first_connect: false,
                linger: 0,
                ..Default::default()
            },
            "tcp://127.0.0.1:*",
        )
        .unwrap();
        assert!(!server.connected());

        let endpoint = server.get_last_endpoint().unwrap().unwrap();
        let client = ctx.socket(zmq::DEALER).unwrap();
        client.set_linger(0).unwrap();
        client.connect(&endpoint).unwrap();

        // Events arrive asynchronously
        for _ in 0..100 {
            if server.connected() {
                break;
            }
            thread::sleep(std::time::Duration::from_millis(10));
        }
        assert_eq!(server.num_peers(), 1);
    }
}
