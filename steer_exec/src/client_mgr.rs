//! # Client manager
//!
//! Holds one [`SteerCtrl`] for every simulator client the server is talking to, and turns the
//! packets received from a client into the packets to send back to it.
//!
//! A client's session starts when it sends a connect packet, or implicitly when telemetry arrives
//! from a client that isn't known yet. The session ends on a disconnect packet, when the client
//! has been silent for longer than the client timeout, or when the server shuts down. Sessions
//! never share any state.

// ---------------------------------------------------------------------------
// IMPORTS
// ---------------------------------------------------------------------------

// External
use log::{debug, info, trace, warn};
use serde::Serialize;
use std::collections::HashMap;
use std::time::{Duration, Instant};

// Internal
use crate::steer_ctrl::{
    CtrlMode, InitData, InputData, OutputData, ParamsError, Profile, SteerCtrl, SteerCtrlError,
    ThrottleAction,
};
use comms_if::sim::{SimMessage, Telemetry};
use util::{archive::Archived, module::State, session::Session};

// ---------------------------------------------------------------------------
// DATA STRUCTURES
// ---------------------------------------------------------------------------

/// Manages the control sessions of all connected clients.
pub struct ClientMgr {
    profile_name: String,

    profile: Profile,

    client_timeout: Duration,

    /// Run session used for archives and summaries, if archiving is enabled
    session: Option<Session>,

    clients: HashMap<Vec<u8>, Client>,
}

/// Summary of a client's session, saved when the session ends.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ClientSummary {
    /// Name of the client, the hex encoded transport identity
    pub client: String,

    /// Name of the tuning profile used
    pub profile: String,

    /// Number of records which produced a steering command
    pub num_records: usize,

    /// Number of records which were rejected and answered with the safe output
    pub num_rejected: usize,

    /// Number of records answered while under manual control
    pub num_manual: usize,

    pub num_coast: usize,

    pub num_brake: usize,

    /// Number of commands where the steering demand was saturated
    pub num_steer_limited: usize,

    pub max_abs_cte: f64,

    /// Wall-clock duration of the session.
    ///
    /// Units: seconds
    pub duration_s: f64,
}

struct Client {
    ctrl: SteerCtrl,

    started: Instant,

    last_seen: Instant,

    summary: ClientSummary,
}

// ---------------------------------------------------------------------------
// IMPLEMENTATIONS
// ---------------------------------------------------------------------------

impl ClientMgr {
    /// Create a new client manager which will control every client with the given profile.
    ///
    /// The profile is validated here, so every client's controller can be initialised from it.
    pub fn new(
        profile_name: &str,
        profile: Profile,
        client_timeout: Duration,
    ) -> Result<Self, ParamsError> {
        profile.validate()?;

        Ok(Self {
            profile_name: profile_name.into(),
            profile,
            client_timeout,
            session: None,
            clients: HashMap::new(),
        })
    }

    /// Archive traces and save session summaries into the given run session.
    pub fn with_archive(mut self, session: Session) -> Self {
        self.session = Some(session);
        self
    }

    /// Handle a packet from the client with the given identity, received at `now`.
    ///
    /// Returns the packet to send back to the client, if any.
    pub fn handle(&mut self, id: &[u8], packet: &str, now: Instant) -> Option<String> {
        let msg = match SimMessage::decode(packet) {
            Ok(m) => m,
            Err(e) => {
                warn!("Dropping packet from client {}: {}", client_name(id), e);
                return None;
            }
        };

        match msg {
            SimMessage::Connect => {
                // A reconnecting client starts again from scratch
                if self.clients.contains_key(id) {
                    self.end_client(id, now);
                }
                self.start_client(id, Some(now));
                None
            }
            SimMessage::Disconnect => {
                if self.end_client(id, now).is_none() {
                    debug!("Disconnect from unknown client {}", client_name(id));
                }
                None
            }
            SimMessage::Telemetry(telem) => Some(self.handle_telemetry(id, &telem, now)),
            SimMessage::Manual => {
                let client = self.client_mut(id, now);
                client.last_seen = now;
                client.summary.num_manual += 1;
                Some(SimMessage::Manual.encode())
            }
            m => {
                debug!(
                    "Ignoring unexpected message from client {}: {:?}",
                    client_name(id),
                    m
                );
                None
            }
        }
    }

    /// Start a new session for the given client, replacing any existing one.
    ///
    /// `start_time` seeds the clock of the client's controller, if `None` the first telemetry
    /// record only seeds the clock.
    pub fn start_client(&mut self, id: &[u8], start_time: Option<Instant>) {
        let client = new_client(
            id,
            &self.profile_name,
            &self.profile,
            self.session.as_ref(),
            start_time,
            start_time.unwrap_or_else(Instant::now),
        );

        self.clients.insert(id.to_vec(), client);
    }

    /// End the session of the given client, discarding its controller.
    ///
    /// Returns the summary of the session, or `None` if the client wasn't known.
    pub fn end_client(&mut self, id: &[u8], now: Instant) -> Option<ClientSummary> {
        let client = self.clients.remove(id)?;

        let mut summary = client.summary;
        summary.duration_s = now
            .checked_duration_since(client.started)
            .unwrap_or_default()
            .as_secs_f64();

        info!(
            "Client {} disconnected after {:.1} s: {} records, {} rejected",
            summary.client, summary.duration_s, summary.num_records, summary.num_rejected
        );

        if let Some(ref session) = self.session {
            session.save(format!("clients/{}.json", summary.client), summary.clone());
        }

        Some(summary)
    }

    /// End the sessions of all clients which have been silent for longer than the client
    /// timeout.
    ///
    /// Returns the number of sessions ended.
    pub fn reap_idle(&mut self, now: Instant) -> usize {
        let timeout = self.client_timeout;
        let idle: Vec<Vec<u8>> = self
            .clients
            .iter()
            .filter(|(_, c)| now.checked_duration_since(c.last_seen).unwrap_or_default() > timeout)
            .map(|(id, _)| id.clone())
            .collect();

        for id in idle.iter() {
            warn!(
                "Client {} has been silent for more than {:.1} s, ending its session",
                client_name(id),
                timeout.as_secs_f64()
            );
            self.end_client(id, now);
        }

        idle.len()
    }

    /// End every session.
    pub fn end_all(&mut self, now: Instant) -> Vec<ClientSummary> {
        let ids: Vec<Vec<u8>> = self.clients.keys().cloned().collect();

        ids.iter().filter_map(|id| self.end_client(id, now)).collect()
    }

    pub fn num_clients(&self) -> usize {
        self.clients.len()
    }

    /// Get the control mode of the given client, if it is connected.
    pub fn mode(&self, id: &[u8]) -> Option<CtrlMode> {
        self.clients.get(id).map(|c| c.ctrl.mode())
    }

    /// Get the summary so far of the given client, if it is connected.
    pub fn summary(&self, id: &[u8]) -> Option<&ClientSummary> {
        self.clients.get(id).map(|c| &c.summary)
    }

    fn handle_telemetry(&mut self, id: &[u8], telem: &Telemetry, now: Instant) -> String {
        let client = self.client_mut(id, now);
        client.last_seen = now;

        let input = InputData::from_telemetry(telem, now);

        let output = match client.ctrl.proc(&input) {
            Ok((output, report)) => {
                let summary = &mut client.summary;
                summary.num_records += 1;
                summary.max_abs_cte = summary.max_abs_cte.max(telem.cte.abs());
                if report.steer_limited {
                    summary.num_steer_limited += 1;
                }
                match report.throttle_action {
                    Some(ThrottleAction::Coast) => summary.num_coast += 1,
                    Some(ThrottleAction::Brake) => summary.num_brake += 1,
                    _ => (),
                }

                if let Err(e) = client.ctrl.write() {
                    warn!(
                        "Could not write trace archive for client {}: {}",
                        client.summary.client, e
                    );
                }

                output
            }
            Err(SteerCtrlError::ClockNotSeeded) => {
                debug!(
                    "First record from client {} used to seed the clock",
                    client.summary.client
                );
                client.summary.num_rejected += 1;
                client.ctrl.safe_output()
            }
            Err(e) => {
                warn!(
                    "Rejected telemetry from client {}: {}",
                    client.summary.client, e
                );
                client.summary.num_rejected += 1;
                client.ctrl.safe_output()
            }
        };

        trace!("Reply to client {}: {:?}", client.summary.client, output);

        steer_packet(output)
    }

    /// Get the client with the given ID, starting an implicit session if it isn't known.
    ///
    /// The controller of an implicit session has no seeded clock.
    fn client_mut(&mut self, id: &[u8], now: Instant) -> &mut Client {
        let Self {
            profile_name,
            profile,
            session,
            clients,
            ..
        } = self;

        clients.entry(id.to_vec()).or_insert_with(|| {
            debug!(
                "Packet from unknown client {}, starting a session",
                client_name(id)
            );
            new_client(id, profile_name, profile, session.as_ref(), None, now)
        })
    }
}

// ---------------------------------------------------------------------------
// PRIVATE FUNCTIONS
// ---------------------------------------------------------------------------

/// Get a printable name for a client from its identity.
fn client_name(id: &[u8]) -> String {
    id.iter().map(|b| format!("{:02x}", b)).collect()
}

fn new_client(
    id: &[u8],
    profile_name: &str,
    profile: &Profile,
    session: Option<&Session>,
    start_time: Option<Instant>,
    now: Instant,
) -> Client {
    let name = client_name(id);

    let mut ctrl = SteerCtrl::default();
    if let Err(e) = ctrl.init(InitData {
        profile: profile.clone(),
        start_time,
    }) {
        // The profile was validated by ClientMgr::new
        warn!("Could not initialise steering control for client {}: {}", name, e);
    }

    if let Some(session) = session {
        let path = format!("steer_ctrl/{}.csv", name);
        if let Err(e) = ctrl.enable_archive(session, &path) {
            warn!("Could not create trace archive for client {}: {}", name, e);
        }
    }

    info!("Client {} connected, using the {:?} profile", name, profile_name);

    Client {
        ctrl,
        started: now,
        last_seen: now,
        summary: ClientSummary {
            client: name,
            profile: profile_name.into(),
            ..Default::default()
        },
    }
}

fn steer_packet(output: OutputData) -> String {
    SimMessage::Steer(output.into()).encode()
}

#[cfg(test)]
mod test {
    use super::*;
    use comms_if::sim::SteerCmd;

    const EPS: f64 = 1e-9;

    fn mgr() -> ClientMgr {
        ClientMgr::new("smooth", Profile::default(), Duration::from_secs(5)).unwrap()
    }

    #[test]
    fn test_invalid_profile_rejected() {
        let bad = Profile {
            integral_window: 0,
            ..Default::default()
        };

        assert!(matches!(
            ClientMgr::new("bad", bad, Duration::from_secs(5)),
            Err(ParamsError::InvalidProfile(_))
        ));
    }

    fn telem(cte: f64, speed: f64) -> String {
        SimMessage::Telemetry(Telemetry {
            cte,
            speed,
            steering_angle: 0.0,
        })
        .encode()
    }

    fn steer(reply: Option<String>) -> SteerCmd {
        match SimMessage::decode(&reply.unwrap()).unwrap() {
            SimMessage::Steer(cmd) => cmd,
            m => panic!("Expected a steer message, got {:?}", m),
        }
    }

    #[test]
    fn test_connect_then_telemetry() {
        let mut mgr = mgr();
        let t0 = Instant::now();

        assert_eq!(mgr.handle(b"a", "40", t0), None);
        assert_eq!(mgr.num_clients(), 1);
        assert_eq!(mgr.mode(b"a"), Some(CtrlMode::Uninitialised));

        let cmd = steer(mgr.handle(b"a", &telem(0.5, 0.0), t0 + Duration::from_millis(100)));
        assert!((cmd.steering_angle + 0.2125).abs() < EPS);
        assert_eq!(cmd.throttle, 0.0);
        assert_eq!(mgr.mode(b"a"), Some(CtrlMode::Steady));

        let summary = mgr.summary(b"a").unwrap();
        assert_eq!(summary.client, "61");
        assert_eq!(summary.num_records, 1);
        assert_eq!(summary.num_coast, 1);
        assert_eq!(summary.max_abs_cte, 0.5);
    }

    #[test]
    fn test_implicit_session() {
        let mut mgr = mgr();
        let t0 = Instant::now();

        // No connect packet, so the first record only seeds the clock
        let cmd = steer(mgr.handle(b"b", &telem(0.5, 10.0), t0));
        assert_eq!(cmd, SteerCmd { steering_angle: 0.0, throttle: 0.0 });
        assert_eq!(mgr.mode(b"b"), Some(CtrlMode::Uninitialised));
        assert_eq!(mgr.summary(b"b").unwrap().num_rejected, 1);

        let cmd = steer(mgr.handle(b"b", &telem(0.5, 10.0), t0 + Duration::from_millis(50)));
        assert!(cmd.steering_angle < 0.0);
        assert_eq!(mgr.mode(b"b"), Some(CtrlMode::Steady));
    }

    #[test]
    fn test_rejected_record_holds_steering() {
        let mut mgr = mgr();
        let t0 = Instant::now();
        let t1 = t0 + Duration::from_millis(100);

        mgr.handle(b"a", "40", t0);
        let first = steer(mgr.handle(b"a", &telem(0.3, 10.0), t1));

        // Same timestamp as the previous record
        let held = steer(mgr.handle(b"a", &telem(0.3, 10.0), t1));
        assert_eq!(held.steering_angle, first.steering_angle);
        assert_eq!(held.throttle, 0.0);
        assert_eq!(mgr.summary(b"a").unwrap().num_rejected, 1);
    }

    #[test]
    fn test_manual_reply() {
        let mut mgr = mgr();

        let reply = mgr.handle(b"a", r#"42["telemetry",null]"#, Instant::now());

        assert_eq!(reply.as_deref(), Some(r#"42["manual",{}]"#));
        assert_eq!(mgr.summary(b"a").unwrap().num_manual, 1);
    }

    #[test]
    fn test_invalid_packets_dropped() {
        let mut mgr = mgr();
        let now = Instant::now();

        assert_eq!(mgr.handle(b"a", "hello", now), None);
        assert_eq!(mgr.handle(b"a", r#"42["telemetry",{"cte":"abc"}]"#, now), None);
        assert_eq!(mgr.handle(b"a", r#"42["unknown",{}]"#, now), None);
    }

    #[test]
    fn test_disconnect_ends_session() {
        let mut mgr = mgr();
        let t0 = Instant::now();

        mgr.handle(b"a", "40", t0);
        for i in 1..=10u64 {
            mgr.handle(b"a", &telem(0.1, 15.0), t0 + Duration::from_millis(50 * i));
        }

        let summary = mgr.end_client(b"a", t0 + Duration::from_secs(1)).unwrap();
        assert_eq!(summary.num_records, 10);
        assert_eq!(summary.num_rejected, 0);
        assert!((summary.duration_s - 1.0).abs() < EPS);
        assert_eq!(mgr.num_clients(), 0);

        assert_eq!(mgr.handle(b"a", "41", t0), None);
        assert!(mgr.end_client(b"a", t0).is_none());
    }

    #[test]
    fn test_reconnect_resets() {
        let mut mgr = mgr();
        let t0 = Instant::now();

        mgr.handle(b"a", "40", t0);
        mgr.handle(b"a", &telem(0.8, 15.0), t0 + Duration::from_millis(50));
        assert_eq!(mgr.mode(b"a"), Some(CtrlMode::Steady));

        let t1 = t0 + Duration::from_secs(2);
        mgr.handle(b"a", "40", t1);
        assert_eq!(mgr.mode(b"a"), Some(CtrlMode::Uninitialised));

        let cmd = steer(mgr.handle(b"a", &telem(0.5, 0.0), t1 + Duration::from_millis(100)));
        assert!((cmd.steering_angle + 0.2125).abs() < EPS);
    }

    #[test]
    fn test_clients_are_independent() {
        let mut mgr = mgr();
        let t0 = Instant::now();

        mgr.handle(b"a", "40", t0);
        mgr.handle(b"b", "40", t0);

        // Drive client a a long way off the path
        for i in 1..=20u64 {
            mgr.handle(b"a", &telem(2.0, 20.0), t0 + Duration::from_millis(50 * i));
        }

        let cmd = steer(mgr.handle(b"b", &telem(0.5, 0.0), t0 + Duration::from_millis(100)));
        assert!((cmd.steering_angle + 0.2125).abs() < EPS);
        assert_eq!(mgr.num_clients(), 2);
    }

    #[test]
    fn test_reap_idle() {
        let mut mgr = mgr();
        let t0 = Instant::now();

        mgr.handle(b"a", "40", t0);
        mgr.handle(b"b", "40", t0);
        mgr.handle(b"b", &telem(0.1, 5.0), t0 + Duration::from_secs(4));

        assert_eq!(mgr.reap_idle(t0 + Duration::from_secs(5)), 0);
        assert_eq!(mgr.reap_idle(t0 + Duration::from_secs(6)), 1);
        assert!(mgr.mode(b"a").is_none());
        assert!(mgr.mode(b"b").is_some());

        assert_eq!(mgr.end_all(t0 + Duration::from_secs(7)).len(), 1);
        assert_eq!(mgr.num_clients(), 0);
    }

    #[test]
    fn test_summary_json() {
        let mut mgr = mgr();
        let t0 = Instant::now();

        mgr.handle(&[0x00, 0x6b, 0x8b, 0x45, 0x67], "40", t0);
        let summary = mgr
            .end_client(&[0x00, 0x6b, 0x8b, 0x45, 0x67], t0 + Duration::from_millis(500))
            .unwrap();

        let val = serde_json::to_value(&summary).unwrap();
        assert_eq!(val["client"], "006b8b4567");
        assert_eq!(val["profile"], "smooth");
        assert_eq!(val["num_records"], 0);
        assert_eq!(val["duration_s"], 0.5);
    }
}
