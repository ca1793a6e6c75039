//! Bluetooth proximity unlock CLI binary.
//!
//! # Commands
//!
//! - `companion` - Serve a simulated companion device over TCP
//! - `demo` - Register a device and unlock against a local companion, in-process
//! - `keygen` - Generate a device key / auth key pair

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use btproximity::{
    auth::{AuthStage, Authenticator, FindScope, SoftwareAuthenticator},
    config::Config,
    crypto::{KeyMaterial, DEFAULT_KEY_SIZE},
    device::{ConsentStatus, LogNotifier, PairedDevice, RemoteService, StaticCatalog},
    orchestrator::{register_device, Orchestrator},
    peer::{serve_tcp, PeerIdentity},
    protocol::SessionOutcome,
    transport::{FlowSignal, ServiceRecord, TcpConnector, MIN_SERVICE_VERSION, SERVICE_NAME},
    VERSION,
};
use clap::{Parser, Subcommand};
use tokio::net::TcpListener;

#[derive(Parser)]
#[command(name = "btproximity")]
#[command(version = VERSION)]
#[command(about = "Bluetooth proximity unlock - companion-device authentication", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve a simulated companion device over TCP
    Companion {
        /// Listen port
        #[arg(short, long, default_value = "4500")]
        port: u16,

        /// Listen host
        #[arg(long, default_value = "127.0.0.1")]
        host: String,

        /// Device name reported at registration
        #[arg(long, default_value = "btProximity companion")]
        name: String,

        /// Device model reported at registration
        #[arg(long, default_value = "simulator")]
        model: String,

        /// Base64 device key (generated when omitted)
        #[arg(long, requires = "auth_key")]
        device_key: Option<String>,

        /// Base64 auth key (generated when omitted)
        #[arg(long, requires = "device_key")]
        auth_key: Option<String>,

        /// Config file (default: user config dir)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Verbose logging
        #[arg(short, long)]
        verbose: bool,
    },

    /// Register a device and unlock against a local companion
    Demo {
        /// Config file (default: user config dir)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Verbose logging
        #[arg(short, long)]
        verbose: bool,
    },

    /// Generate a device key / auth key pair
    Keygen {
        /// Key size in bytes
        #[arg(short, long, default_value_t = DEFAULT_KEY_SIZE)]
        size: usize,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Companion {
            port,
            host,
            name,
            model,
            device_key,
            auth_key,
            config,
            verbose,
        } => cmd_companion(port, &host, name, model, device_key, auth_key, config, verbose),

        Commands::Demo { config, verbose } => cmd_demo(config, verbose),

        Commands::Keygen { size, json } => cmd_keygen(size, json),
    }
}

fn init_logging(verbose: bool) {
    let log_level = if verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .init();
}

fn load_config(path: Option<PathBuf>) -> anyhow::Result<Config> {
    let file_config = match path.or_else(Config::default_path) {
        Some(path) if path.exists() => {
            tracing::info!("Loading config from {}", path.display());
            Config::from_file(&path)?
        }
        _ => Config::default(),
    };
    let config = file_config.merge(Config::from_env());
    config.validate()?;
    Ok(config)
}

#[allow(clippy::too_many_arguments)]
fn cmd_companion(
    port: u16,
    host: &str,
    name: String,
    model: String,
    device_key: Option<String>,
    auth_key: Option<String>,
    config: Option<PathBuf>,
    verbose: bool,
) -> anyhow::Result<()> {
    init_logging(verbose);
    let config = load_config(config)?;

    let identity = match (device_key, auth_key) {
        (Some(dk), Some(ak)) => PeerIdentity::new(
            name,
            model,
            KeyMaterial::from_base64(&dk)?,
            KeyMaterial::from_base64(&ak)?,
        ),
        _ => {
            let identity = PeerIdentity::generate(name, model);
            tracing::info!("Generated fresh keys for this companion");
            identity
        }
    };

    let addr: SocketAddr = format!("{host}:{port}").parse()?;
    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async {
        let listener = TcpListener::bind(addr).await?;
        let shutdown = FlowSignal::new();

        let ctrl_c = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Shutting down");
                ctrl_c.complete();
            }
        });

        serve_tcp(
            listener,
            Arc::new(identity),
            config.transport.max_frame_len,
            shutdown,
        )
        .await?;
        Ok::<_, anyhow::Error>(())
    })
}

fn cmd_demo(config: Option<PathBuf>, verbose: bool) -> anyhow::Result<()> {
    init_logging(verbose);
    let config = load_config(config)?;

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async {
        // Simulated companion on an ephemeral port
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let shutdown = FlowSignal::new();
        let identity = Arc::new(PeerIdentity::generate("Demo phone", "simulator"));
        let companion = tokio::spawn(serve_tcp(
            listener,
            identity,
            config.transport.max_frame_len,
            shutdown.clone(),
        ));

        let software = Arc::new(
            SoftwareAuthenticator::new().with_attempt_ttl(config.session.attempt_ttl()),
        );
        let authenticator: Arc<dyn Authenticator> = software.clone();
        let connector = TcpConnector::new();
        let endpoint = TcpConnector::endpoint(addr);

        // Registration
        let outcome =
            register_device(Arc::clone(&authenticator), &connector, &endpoint, &config).await?;
        println!("Registration: {}", serde_json::to_string(&outcome)?);
        if !outcome.is_success() {
            shutdown.complete();
            anyhow::bail!("registration failed");
        }
        for device in authenticator.list_registered_devices(FindScope::User).await? {
            println!("  {} ({}) {}", device.friendly_name, device.model_number, device.device_id);
        }

        // Unlock
        let catalog = StaticCatalog::new().with_device(
            PairedDevice::new(addr.to_string(), "Demo phone"),
            ConsentStatus::Allowed,
            Some(RemoteService {
                endpoint,
                record: ServiceRecord::for_service(SERVICE_NAME, Some(MIN_SERVICE_VERSION)),
            }),
        );
        let mut orchestrator = Orchestrator::new(
            Arc::clone(&authenticator),
            Arc::new(catalog),
            Arc::new(LogNotifier::new()),
            Arc::new(connector),
            config.clone(),
        );
        let ready = orchestrator.ready_signal();
        let exit = orchestrator.exit_signal();
        let run = tokio::spawn(async move { orchestrator.run().await });

        ready.completed().await;
        software.publish_stage(AuthStage::WaitingForUserConfirmation).await;
        software.publish_stage(AuthStage::CollectingCredential).await;

        // Bound the demo in case the host never stops authentication
        let limit = config.session.session_timeout() + Duration::from_secs(1);
        let watchdog = tokio::spawn(async move {
            tokio::time::sleep(limit).await;
            exit.complete();
        });

        let summary = run.await??;
        watchdog.abort();
        shutdown.complete();
        companion.await??;

        for outcome in &summary.outcomes {
            println!("Unlock: {}", serde_json::to_string(outcome)?);
        }
        if !summary.authenticated() {
            let reason = summary
                .outcomes
                .iter()
                .find_map(SessionOutcome::reason)
                .unwrap_or("no session completed");
            anyhow::bail!("unlock failed: {reason}");
        }
        Ok(())
    })
}

fn cmd_keygen(size: usize, json: bool) -> anyhow::Result<()> {
    anyhow::ensure!(size > 0, "key size must be positive");

    let device_key = KeyMaterial::generate(size);
    let auth_key = KeyMaterial::generate(size);

    if json {
        let out = serde_json::json!({
            "device_key": device_key.to_base64(),
            "auth_key": auth_key.to_base64(),
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else {
        println!("device_key: {}", device_key.to_base64());
        println!("auth_key:   {}", auth_key.to_base64());
    }
    Ok(())
}
