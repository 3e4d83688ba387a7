//! Connects to a server, walks forward for a while and leaves.
//!
//! ```text
//! cargo run --example connect -- --host 127.0.0.1 --port 27910 --seconds 10
//! ```

use std::time::{Duration, Instant};

use clap::Parser;
use netchan_client::prelude::*;
use netchan_client::telemetry::TracingObserver;
use std::sync::Arc;

#[derive(Parser)]
struct Opt {
    /// Server host name or address.
    #[arg(long, default_value = "127.0.0.1")]
    host: String,
    /// Server port.
    #[arg(short, long, default_value_t = 27910)]
    port: u16,
    /// Player name sent in the profile.
    #[arg(short, long, default_value = "netchan")]
    name: String,
    /// How long to stay in the game.
    #[arg(short, long, default_value_t = 10)]
    seconds: u64,
    /// Record inbound datagrams to this file.
    #[arg(long)]
    record: Option<std::path::PathBuf>,
    /// Use the LAN timing preset.
    #[arg(long)]
    lan: bool,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // configure logging: netchan-client logs go to standard out
    tracing::subscriber::set_global_default(
        tracing_subscriber::FmtSubscriber::builder()
            .with_max_level(tracing::Level::INFO)
            .finish(),
    )?;

    let opt = Opt::parse();
    let config = if opt.lan {
        SessionConfig::lan()
    } else {
        SessionConfig::default()
    };

    let mut builder = SessionBuilder::<GameState>::new()
        .with_config(config)
        .with_profile(format!("\\name\\{}\\skin\\male/grunt\\rate\\25000\\msg\\1\\hand\\2", opt.name))
        .with_violation_observer(Arc::new(TracingObserver))
        .with_observer(|world: &GameState| {
            if let Some(frame) = world.current_frame_number() {
                if frame % 50 == 0 {
                    tracing::info!(frame, entities = world.entities().len(), "world update");
                }
            }
        });
    if let Some(path) = &opt.record {
        builder = builder.with_recorder(FileRecorder::create(path)?);
    }
    let session = builder.build()?;

    session.connect(&opt.host, opt.port)?;
    tracing::info!(
        client_id = ?session.client_id(),
        map = ?session.with_world(|w| w.map_name().map(str::to_owned)),
        "in game"
    );

    session.send_command("say hello from netchan-client")?;

    let deadline = Instant::now() + Duration::from_secs(opt.seconds);
    let mut yaw = 0.0f32;
    while Instant::now() < deadline {
        if !session.is_spawned() && !session.wait_until_spawned(Duration::from_secs(5)) {
            tracing::warn!(state = %session.state(), "not spawned, giving up");
            break;
        }
        // Walk forward while slowly turning.
        yaw = (yaw + 2.0) % 360.0;
        session.set_pending_move([0.0, yaw, 0.0], [200.0, 0.0, 0.0], Action::IDLE);
        std::thread::sleep(Duration::from_millis(50));
    }

    tracing::info!(stats = %session.stats(), ping = ?session.ping(), "leaving");
    session.disconnect();
    Ok(())
}
