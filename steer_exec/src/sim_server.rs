//! # Simulator Server Module
//!
//! This module abstracts over the networking side of the steering executable. The server binds a
//! ROUTER socket which any number of simulator clients can connect to. Each packet is handed to
//! the [`ClientMgr`] along with the identity of the client which sent it, and any reply is routed
//! back to the same client.
//!
//! Both DEALER and REQ clients are supported, the reply reuses the whole envelope of the request.

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use comms_if::net::{zmq, MonitoredSocket, MonitoredSocketError, NetParams, SocketOptions};
use log::{info, trace, warn};
use std::time::{Duration, Instant};

use crate::client_mgr::{ClientMgr, ClientSummary};

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

/// An abstraction over the networking part of the steering executable.
pub struct SimServer {
    /// ROUTER socket which accepts packets from the clients
    socket: MonitoredSocket,

    clients: ClientMgr,

    /// Number of connected peers when last checked
    num_peers: usize,
}

// ------------------------------------------------------------------------------------------------
// ENUMS
// ------------------------------------------------------------------------------------------------

/// Errors which can occur in the [`SimServer`]
#[derive(thiserror::Error, Debug)]
pub enum SimServerError {
    #[error("Socket error: {0}")]
    SocketError(MonitoredSocketError),

    #[error("Could not receive data from the clients: {0}")]
    RecvError(zmq::Error),

    #[error("Could not send data to a client: {0}")]
    SendError(zmq::Error),
}

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl SimServer {
    /// Create a new instance of the simulator server.
    ///
    /// This function will not wait for a connection from a client before returning.
    pub fn new(
        ctx: &zmq::Context,
        params: &NetParams,
        clients: ClientMgr,
    ) -> Result<Self, SimServerError> {
        let socket_options = SocketOptions {
            bind: true,
            block_on_first_connect: false,
            recv_timeout: params.recv_timeout_ms,
            send_timeout: 10,
            linger: 0,
            router_mandatory: true,
            ..Default::default()
        };

        let socket = MonitoredSocket::new(ctx, zmq::ROUTER, socket_options, &params.sim_endpoint)?;

        Ok(Self {
            socket,
            clients,
            num_peers: 0,
        })
    }

    /// Receive and process a single packet, sending any reply back to its client.
    ///
    /// Blocks for at most the receive timeout. If nothing is received clients which have gone
    /// silent are ended. Problems with individual packets are logged and the packet dropped, only
    /// errors with the socket itself are returned.
    pub fn step(&mut self) -> Result<(), SimServerError> {
        self.check_peers();

        let frames = match self.socket.recv_multipart(0) {
            Ok(f) => f,
            Err(zmq::Error::EAGAIN) => {
                self.clients.reap_idle(Instant::now());
                return Ok(());
            }
            Err(e) => return Err(SimServerError::RecvError(e)),
        };
        let now = Instant::now();

        // The identity frame is added by the ROUTER, the payload is always the last frame
        if frames.len() < 2 {
            warn!("Received a message with no identity or payload, dropping it");
            return Ok(());
        }
        let id = frames[0].as_slice();
        let payload = &frames[frames.len() - 1];

        let packet = match std::str::from_utf8(payload) {
            Ok(p) => p,
            Err(e) => {
                warn!("Received a non UTF-8 packet: {}", e);
                return Ok(());
            }
        };

        trace!("Received {:?}", packet);

        if let Some(reply) = self.clients.handle(id, packet, now) {
            let mut reply_frames: Vec<&[u8]> =
                frames[..frames.len() - 1].iter().map(Vec::as_slice).collect();
            reply_frames.push(reply.as_bytes());

            match self.socket.send_multipart(reply_frames, 0) {
                Ok(()) => (),
                Err(zmq::Error::EHOSTUNREACH) => {
                    warn!("Client is no longer reachable, ending its session");
                    self.clients.end_client(id, now);
                }
                Err(zmq::Error::EAGAIN) => warn!("Timed out sending a reply, the reply is dropped"),
                Err(e) => return Err(SimServerError::SendError(e)),
            }
        }

        self.clients.reap_idle(now);

        Ok(())
    }

    /// Step the server until a stop condition is met or a socket error occurs.
    ///
    /// The server stops once `run_time` has elapsed, or, when `exit_when_idle` is set, once at
    /// least one client has been seen and every client session has since ended. With neither
    /// condition the server only stops on an error.
    pub fn run(
        &mut self,
        run_time: Option<Duration>,
        exit_when_idle: bool,
    ) -> Result<(), SimServerError> {
        let start = Instant::now();
        let mut seen_client = false;

        loop {
            self.step()?;

            let num_clients = self.clients.num_clients();
            seen_client |= num_clients > 0;

            if exit_when_idle && seen_client && num_clients == 0 {
                info!("All clients have ended, stopping the server");
                return Ok(());
            }

            if let Some(t) = run_time {
                if start.elapsed() >= t {
                    info!("Run time of {:.1} s reached, stopping the server", t.as_secs_f64());
                    return Ok(());
                }
            }
        }
    }

    /// Log any change in the number of transport-level peers.
    ///
    /// A peer which drops its connection without sending a disconnect packet is only ended by the
    /// idle timeout, so this is the earliest sign that a client has gone.
    fn check_peers(&mut self) {
        let num_peers = self.socket.num_peers();

        if num_peers != self.num_peers {
            info!(
                "{} peer(s) connected ({} before), {} client session(s) active",
                num_peers,
                self.num_peers,
                self.clients.num_clients()
            );
            self.num_peers = num_peers;
        }
    }

    /// Number of transport-level peers as of the last step.
    pub fn num_peers(&self) -> usize {
        self.num_peers
    }

    /// The endpoint the server is bound to, with any wildcard port resolved.
    pub fn endpoint(&self) -> Option<String> {
        self.socket.get_last_endpoint().ok().and_then(Result::ok)
    }

    /// End all client sessions.
    pub fn shutdown(&mut self) -> Vec<ClientSummary> {
        self.clients.end_all(Instant::now())
    }

    pub fn clients(&self) -> &ClientMgr {
        &self.clients
    }
}

impl From<MonitoredSocketError> for SimServerError {
    fn from(e: MonitoredSocketError) -> Self {
        SimServerError::SocketError(e)
    }
}
