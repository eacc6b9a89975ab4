use anyhow::{Context, bail};
use meshdrop::core::config::{IDENTITY_FILE, PENDING_FILE};
use meshdrop::core::node::{MeshNode, NodeOptions};
use meshdrop::core::relay::RelayServer;
use meshdrop::core::store_forward::PendingQueues;
use meshdrop::utils::log_file::FileLogLayer;
use meshdrop::utils::sos::SignalOfStop;
use meshdrop::workers::args::Args;
use meshdrop::workers::identity::Identity;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::load();

    // Initialize the global data directory (must happen before any persistence access)
    let data_dir = meshdrop::utils::data_dir::init(args.conf.as_deref())?;

    // webrtc_ice reports late STUN responses as warnings; they are normal.
    let filter = match args.verbose {
        0 => "warn,meshdrop=info,webrtc_ice=error",
        1 => "info,webrtc_ice=error",
        2 => "debug,webrtc_ice=error",
        _ => "trace",
    };

    // stdout belongs to the chat; diagnostics go to stderr and the log file.
    let file_layer = FileLogLayer::new(&data_dir.join("logs").join("meshdrop.log"))
        .context("opening log file")?;
    tracing_subscriber::registry()
        .with(EnvFilter::new(filter))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .init();

    let sos = SignalOfStop::new();

    // Ctrl+C handler
    let sos_clone = sos.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        sos_clone.cancel();
    });

    if let Some(addr) = &args.serve_relay {
        let server = RelayServer::bind(addr).await?;
        return server.run(sos).await;
    }

    let Some(relay_url) = args.relay.clone() else {
        bail!("no relay configured: pass --relay <ws-url> or set `relay` in config.toml");
    };

    let identity = Identity::load_or_create(&data_dir.join(IDENTITY_FILE), args.username.as_deref())?;
    let pending = PendingQueues::load(&data_dir.join(PENDING_FILE))?;

    let options = NodeOptions {
        relay_url,
        stun_servers: args.stun_servers(),
        config: args.mesh_config(),
    };
    MeshNode::new(identity, pending, options, sos)?.run().await
}
