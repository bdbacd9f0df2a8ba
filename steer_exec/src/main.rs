//! # Steering Control Executable
//!
//! This executable serves steering commands to driving simulator clients. Each telemetry record
//! received from a client is passed through that client's steering controller, and the resulting
//! steering and throttle command is sent straight back.

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

// External
use color_eyre::{eyre::WrapErr, Result};
use comms_if::net::{zmq, NetParams};
use log::{error, info};
use std::time::Duration;
use structopt::StructOpt;

// Internal
use steer_lib::{
    client_mgr::ClientMgr,
    sim_server::SimServer,
    steer_ctrl,
};
use util::{
    logger::{logger_init, LevelFilter},
    session::Session,
};

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

#[derive(Debug, StructOpt)]
#[structopt(name = "steer_exec", about = "Steering control server for driving simulators")]
struct Opt {
    /// Name of the tuning profile to use, the file's default profile is used if not given
    #[structopt(short, long)]
    profile: Option<String>,

    /// Minimum level of log messages, must be at least `info`
    #[structopt(long, default_value = "debug")]
    log_level: LevelFilter,

    /// Don't write per-client trace archives or session summaries
    #[structopt(long)]
    no_archive: bool,

    /// Stop the server after this many seconds
    #[structopt(long)]
    run_time_s: Option<f64>,

    /// Stop the server once every client seen so far has ended its session
    #[structopt(long)]
    exit_when_idle: bool,
}

// ------------------------------------------------------------------------------------------------
// MAIN
// ------------------------------------------------------------------------------------------------

fn main() -> Result<()> {
    color_eyre::install()?;

    let opt = Opt::from_args();

    // ---- EARLY INITIALISATION ----

    // Initialise session
    let session = Session::new("steer_exec", "sessions").wrap_err("Failed to create the session")?;

    // Initialise logger
    logger_init(opt.log_level, &session).wrap_err("Failed to initialise logging")?;

    // Log information on this execution.
    info!("Steering Control Executable\n");
    info!("Session directory: {:?}\n", session.session_root);

    info!("Initialising...");

    // ---- LOAD PARAMETERS ----

    let net_params: NetParams =
        util::params::load("net.toml").wrap_err("Could not load net params")?;
    let steer_params: steer_ctrl::Params = util::params::load("steer_ctrl.toml")
        .wrap_err("Could not load steering control params")?;

    let (profile_name, profile) = steer_params
        .profile(opt.profile.as_deref())
        .wrap_err("Could not select the tuning profile")?;

    info!("Parameters loaded, using the {:?} profile", profile_name);

    // ---- SERVER INITIALISATION ----

    let mut clients = ClientMgr::new(
        profile_name,
        profile.clone(),
        Duration::from_secs_f64(net_params.client_timeout_s.max(0.0)),
    )
    .wrap_err("Invalid tuning profile")?;
    if !opt.no_archive {
        clients = clients.with_archive(session.clone());
    }

    let ctx = zmq::Context::new();

    let mut server =
        SimServer::new(&ctx, &net_params, clients).wrap_err("Failed to initialise the server")?;

    info!(
        "Server listening on {}",
        server.endpoint().unwrap_or_else(|| net_params.sim_endpoint.clone())
    );

    // ---- MAIN LOOP ----

    info!("Initialisation complete, entering main loop");

    let run_time = opt
        .run_time_s
        .filter(|t| t.is_finite())
        .map(|t| Duration::from_secs_f64(t.max(0.0)));

    let result = server.run(run_time, opt.exit_when_idle);
    if let Err(ref e) = result {
        error!("Fatal server error: {}", e);
    }

    // ---- SHUTDOWN ----

    let summaries = server.shutdown();
    info!("Ended {} client sessions", summaries.len());

    session.exit();

    result.wrap_err("The server stopped")
}
