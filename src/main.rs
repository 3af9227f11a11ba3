use std::time::Duration;

use clap::{Parser, ValueEnum};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use huddle::config::{
    DEFAULT_BACKEND_URL, DEFAULT_HOST_MARKER, DEFAULT_RELAY_URL, SessionConfig,
};
use huddle::{DescriptionOnlyEngine, HttpAuthority, Role, SessionLifecycle, WsConnector};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum RoleArg {
    Host,
    Guest,
}

impl From<RoleArg> for Role {
    fn from(role: RoleArg) -> Self {
        match role {
            RoleArg::Host => Role::Host,
            RoleArg::Guest => Role::Guest,
        }
    }
}

/// Join a room and print who is in it
#[derive(Debug, Parser)]
#[command(name = "huddle", version)]
struct Args {
    #[arg(long, value_enum, default_value = "host")]
    role: RoleArg,

    #[arg(long, env = "HUDDLE_BACKEND_URL", default_value = DEFAULT_BACKEND_URL)]
    backend: String,

    #[arg(long, env = "HUDDLE_RELAY_URL", default_value = DEFAULT_RELAY_URL)]
    relay: String,

    #[arg(long, env = "HUDDLE_TOKEN")]
    token: Option<String>,

    #[arg(long, env = "HUDDLE_HOST_MARKER", default_value = DEFAULT_HOST_MARKER)]
    host_marker: String,

    /// Host participant poll period in seconds
    #[arg(long, default_value_t = 3)]
    poll_secs: u64,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let mut config = SessionConfig::new(args.backend, args.relay).with_host_marker(args.host_marker);
    config.bearer_token = args.token;
    config.poll_interval = Duration::from_secs(args.poll_secs);

    println!("   Huddle room session");
    println!("   Relay: {}", config.relay_url);
    println!("   Press Ctrl+C to leave\n");

    let authority = HttpAuthority::new(&config)?;
    let mut session = SessionLifecycle::new(config, authority, WsConnector, DescriptionOnlyEngine::new());
    let mut updates = session.updates();

    if let Err(e) = session.start(args.role.into()).await {
        error!("Could not start session: {}", e);
        return Err(e.into());
    }

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        let alive = tokio::select! {
            _ = &mut ctrl_c => {
                info!("Leaving room");
                false
            }
            alive = session.drive() => alive,
        };
        if !alive {
            break;
        }

        if updates.has_changed().unwrap_or(false) {
            let snapshot = updates.borrow_and_update().clone();
            let names: Vec<&str> = snapshot.roster.iter().map(|p| p.display.as_str()).collect();
            info!("{:?}: {} in room {:?}", snapshot.state, names.len(), names);
        }
    }

    session.stop();
    if let Some(failure) = session.snapshot().failure {
        error!("Session ended: {}", failure);
    }
    Ok(())
}
