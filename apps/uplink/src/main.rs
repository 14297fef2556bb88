use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use clap::{Args, Parser, Subcommand};
use peer_transport::{LocalSwitchboard, PeerTransport};
use serde_json::json;
use tokio::time::{Instant, interval, timeout};
use tracing::{debug, info};
use transport_webrtc::{LocalSignaling, WebRtcConfig, WebRtcTransport};
use uplink_session::logging::{self as logctl, LogConfig, LogLevel};
use uplink_session::{
    Config, ConnectionState, Identity, IdentityResolver, LaunchParameters, PeerLink, Session,
    SessionAction, SyntheticSensor, TransportChoice,
};
use url::Url;

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        eprintln!("❌ {err:#}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let log_config = cli.logging.to_config();
    logctl::init(&log_config).context("failed to initialise logging")?;
    debug!(log_level = ?log_config.level, log_file = ?log_config.file, "logging configured");

    match cli.command {
        Command::Resolve(args) => handle_resolve(args),
        Command::Demo(args) => handle_demo(args).await,
    }
}

#[derive(Parser, Debug)]
#[command(
    name = "uplink",
    about = "Pair a scene host with a phone controller over peer-to-peer data channels",
    author,
    version
)]
struct Cli {
    #[command(flatten)]
    logging: LoggingArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug, Clone)]
struct LoggingArgs {
    #[arg(
        long = "log-level",
        value_enum,
        global = true,
        env = "UPLINK_LOG_LEVEL",
        default_value_t = LogLevel::Warn,
        help = "Minimum log level (error, warn, info, debug, trace)"
    )]
    level: LogLevel,

    #[arg(
        long = "log-file",
        value_name = "PATH",
        global = true,
        env = "UPLINK_LOG_FILE",
        help = "Write structured logs to the specified file"
    )]
    file: Option<PathBuf>,
}

impl LoggingArgs {
    fn to_config(&self) -> LogConfig {
        LogConfig {
            level: self.level,
            file: self.file.clone(),
        }
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show which role a launch URL or query string resolves to
    Resolve(ResolveArgs),
    /// Run a client and a remote in this process and stream between them
    Demo(DemoArgs),
}

#[derive(Args, Debug)]
struct ResolveArgs {
    #[arg(value_name = "URL_OR_QUERY", help = "Page URL or query string, e.g. '?id=abc123'")]
    input: String,
}

#[derive(Args, Debug)]
struct DemoArgs {
    #[arg(long, value_enum, help = "Transport to pair over (overrides UPLINK_TRANSPORT)")]
    transport: Option<TransportChoice>,

    #[arg(
        long = "duration-secs",
        value_name = "SECS",
        default_value_t = 5,
        help = "How long to stream before shutting down"
    )]
    duration_secs: u64,

    #[arg(
        long = "frame-rate",
        value_name = "HZ",
        help = "Telemetry frames per second (overrides UPLINK_FRAME_RATE)"
    )]
    frame_rate: Option<u32>,

    #[arg(
        long = "base-url",
        value_name = "URL",
        help = "Origin for the join link (overrides UPLINK_BASE_URL)"
    )]
    base_url: Option<String>,
}

fn handle_resolve(args: ResolveArgs) -> Result<()> {
    let params = LaunchParameters::parse(&args.input);
    let identity = IdentityResolver::resolve(&params);
    let report = json!({
        "role": identity.role().to_string(),
        "target": identity.target().map(|peer| peer.to_string()),
        "showControls": params.show_controls(),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

async fn handle_demo(args: DemoArgs) -> Result<()> {
    let mut config = Config::from_env().context("invalid environment configuration")?;
    if let Some(transport) = args.transport {
        config.transport = transport;
    }
    if let Some(rate) = args.frame_rate {
        config = config.with_frame_rate(rate);
    }
    if let Some(base) = &args.base_url {
        config.base_url = Url::parse(base).with_context(|| format!("invalid --base-url {base}"))?;
    }
    let session_config = config.session();
    let (client_transport, remote_transport) = build_transports(&config);

    let client_identity = IdentityResolver::resolve(&LaunchParameters::default());
    let client = match Session::start(client_identity, client_transport, &session_config)? {
        Session::Client(client) => client,
        Session::Remote(_) => bail!("empty launch parameters resolved to the remote role"),
    };
    wait_for_open(client.link(), config.dial_timeout).await?;

    let join = client
        .join_link(&config.base_url)
        .ok_or_else(|| anyhow!("client registered without an identifier"))?;
    println!("📱 join link: {join}");

    let telemetry_frames = Arc::new(AtomicU64::new(0));
    let counter = Arc::clone(&telemetry_frames);
    client.register_telemetry_handler(move |endpoint, sample| {
        let frame = counter.fetch_add(1, Ordering::Relaxed) + 1;
        if frame % 60 == 0 {
            info!(
                target = "uplink::demo",
                %endpoint,
                frame,
                alpha = sample.orientation.alpha,
                beta = sample.orientation.beta,
                gamma = sample.orientation.gamma,
                "telemetry"
            );
        }
    });

    let remote_identity = IdentityResolver::resolve(&LaunchParameters::from_url(join.as_str()));
    if !matches!(remote_identity, Identity::Remote(_)) {
        bail!("join link {join} did not resolve to the remote role");
    }
    let remote = match Session::start(remote_identity, remote_transport, &session_config)? {
        Session::Remote(remote) => remote,
        Session::Client(_) => bail!("join link resolved to the client role"),
    };
    remote
        .start_telemetry(Arc::new(SyntheticSensor::new()))
        .context("failed to start telemetry")?;

    let deadline = Instant::now() + Duration::from_secs(args.duration_secs);
    let mut ticker = interval(Duration::from_secs(1));
    let mut second = 0u64;
    while Instant::now() < deadline {
        ticker.tick().await;
        second += 1;
        let reached = match second % 4 {
            0 => client.state().apply_action(SessionAction::ToggleAbout),
            1 => client.state().set_headlights(second % 8 == 1),
            2 => client.state().apply_action(SessionAction::ToggleCv),
            _ => client.state().set_taillights(second % 8 == 3),
        };
        let mirrored = remote.mirror().snapshot();
        println!(
            "⏱  {second:>3}s  pushed to {reached}  telemetry {}  mirror: about={} cv={} head={} tail={}",
            telemetry_frames.load(Ordering::Relaxed),
            mirrored.show_about,
            mirrored.show_cv,
            mirrored.headlights_on,
            mirrored.taillights_on,
        );
    }

    remote.stop_telemetry();
    info!(
        target = "uplink::demo",
        client = ?client.link().stats(),
        remote = ?remote.link().stats(),
        router = ?client.link().router().stats(),
        "demo finished"
    );
    remote.shutdown();
    client.shutdown();
    println!(
        "✅ {} telemetry frames received, {} state pushes sent",
        telemetry_frames.load(Ordering::Relaxed),
        client.state().pushes_sent()
    );
    Ok(())
}

fn build_transports(config: &Config) -> (Arc<dyn PeerTransport>, Arc<dyn PeerTransport>) {
    match config.transport {
        TransportChoice::Local => {
            let board = LocalSwitchboard::new();
            (Arc::new(board.transport()), Arc::new(board.transport()))
        }
        TransportChoice::Webrtc => {
            let signaling = Arc::new(LocalSignaling::new());
            let rtc = WebRtcConfig::new(config.disable_stun);
            (
                Arc::new(WebRtcTransport::new(rtc.clone(), signaling.clone())),
                Arc::new(WebRtcTransport::new(rtc, signaling)),
            )
        }
    }
}

async fn wait_for_open(link: &PeerLink, limit: Duration) -> Result<()> {
    let mut states = link.watch_state();
    timeout(limit, states.wait_for(|state| *state == ConnectionState::Open))
        .await
        .context("timed out registering with signaling")?
        .context("link dropped before registering")?;
    Ok(())
}
