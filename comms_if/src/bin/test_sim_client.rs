//! Simple simulator client test
//!
//! Connects to a steering server, streams telemetry from a crude lateral vehicle model and prints
//! the commands which come back. The model closes the loop so the printed cross-track error should
//! settle if the server is tuned sensibly.

use comms_if::{
    net::{zmq, MonitoredSocket, SocketOptions},
    sim::{SimMessage, Telemetry},
};
use std::time::{Duration, Instant};
use structopt::StructOpt;

/// Maximum steering angle of the modelled vehicle for a normalised demand of 1.
const MAX_STEER_DEG: f64 = 25.0;

#[derive(Debug, StructOpt)]
#[structopt(name = "test_sim_client", about = "Stream synthetic telemetry to a steering server")]
struct Opt {
    /// Endpoint of the server
    #[structopt(short, long, default_value = "tcp://localhost:4567")]
    endpoint: String,

    /// Telemetry rate
    #[structopt(long, default_value = "20")]
    rate_hz: f64,

    /// How long to run for
    #[structopt(long, default_value = "10")]
    duration_s: f64,

    /// Speed of the modelled vehicle
    #[structopt(long, default_value = "20")]
    speed: f64,

    /// Initial cross-track error
    #[structopt(long, default_value = "1.0")]
    initial_cte: f64,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let opt = Opt::from_args();

    let ctx = zmq::Context::new();

    let socket_options = SocketOptions {
        connect_timeout: 1000,
        heartbeat_ivl: 500,
        heartbeat_ttl: 1000,
        heartbeat_timeout: 1000,
        linger: 1,
        recv_timeout: 500,
        send_timeout: 10,
        ..Default::default()
    };

    let socket = match MonitoredSocket::new(&ctx, zmq::DEALER, socket_options, &opt.endpoint) {
        Ok(s) => s,
        Err(e) => {
            println!("Could not connect to the server");
            return Err(e.into());
        }
    };

    socket.send(SimMessage::Connect.encode().as_str(), 0)?;

    let period = Duration::from_secs_f64(1.0 / opt.rate_hz);
    let start = Instant::now();
    let mut cte = opt.initial_cte;
    let mut steer = 0.0;

    println!("time_s;cte;steer;throttle");

    while start.elapsed().as_secs_f64() < opt.duration_s {
        let telem = Telemetry {
            cte,
            speed: opt.speed,
            steering_angle: steer * MAX_STEER_DEG,
        };
        socket.send(SimMessage::Telemetry(telem).encode().as_str(), 0)?;

        // Wait for the reply to this record
        let reply = match socket.recv_string(0) {
            Ok(Ok(s)) => s,
            Ok(Err(_)) => {
                println!("Non UTF-8 reply");
                continue;
            }
            Err(e) => {
                println!(
                    "could not read from server: {} (connected: {})",
                    e,
                    socket.connected()
                );
                continue;
            }
        };

        match SimMessage::decode(&reply) {
            Ok(SimMessage::Steer(cmd)) => {
                steer = cmd.steering_angle;
                println!(
                    "{:.3};{:.4};{:.4};{:.2}",
                    start.elapsed().as_secs_f64(),
                    cte,
                    cmd.steering_angle,
                    cmd.throttle
                );
            }
            Ok(m) => println!("reply: {:?}", m),
            Err(e) => println!("invalid reply: {}", e),
        }

        std::thread::sleep(period);

        // Move the vehicle laterally according to the steering demand
        let dt = period.as_secs_f64();
        cte += opt.speed * (steer * MAX_STEER_DEG).to_radians().sin() * dt;
    }

    socket.send(SimMessage::Disconnect.encode().as_str(), 0)?;

    Ok(())
}
