use clap::{Parser, Subcommand};
use pkg_constants::network::{DEFAULT_DB_URL, DEFAULT_DEVICE_NAME};
use pkg_constants::paths::DEFAULT_CONFIG;
use pkg_constants::state::{CONTROL_DOC, DEVICE_DOC};
use pkg_state::{
    Clock, CoordinatorConfig, CouchStore, DocumentStore, LeaseCoordinator, SystemClock,
};
use pkg_types::config::{ConnectionConfigFile, load_config_file};
use pkg_types::control::{ControlCommand, ControlMode};
use pkg_types::device::DeviceState;
use pkg_types::document::Document;
use pkg_types::lease::LeaseRecord;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "teleopctl", about = "Take and use the control lease of a teleoperated device")]
struct Cli {
    /// Path to YAML config file
    #[arg(long, short, default_value = DEFAULT_CONFIG)]
    config: String,

    /// Document store base URL
    #[arg(long)]
    db_url: Option<String>,

    /// Device name (selects the `d_<device>` database)
    #[arg(long)]
    device: Option<String>,

    /// Bearer token attached to every store request
    #[arg(long)]
    token: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the control lease and device state without contending for the lease
    Status,
    /// Take the control lease and keep renewing it until Ctrl-C
    Hold,
    /// Set the device operating mode (safe, manual, auto)
    Mode { mode: ControlMode },
}

struct Settings {
    db_url: String,
    device: String,
    token: Option<String>,
    coordinator: CoordinatorConfig,
}

fn resolve_settings(cli: &Cli) -> anyhow::Result<Settings> {
    // Load config file (returns defaults if file not found)
    let file_cfg: ConnectionConfigFile = load_config_file(&cli.config)?;
    info!("Config file: {}", cli.config);

    // Merge: CLI args > config file > defaults
    let db_url = cli
        .db_url
        .clone()
        .or(file_cfg.db_url)
        .unwrap_or_else(|| DEFAULT_DB_URL.to_string());
    let device = cli
        .device
        .clone()
        .or(file_cfg.device)
        .unwrap_or_else(|| DEFAULT_DEVICE_NAME.to_string());
    let token = cli.token.clone().or(file_cfg.token);

    let mut coordinator = match file_cfg.lease_window_ms {
        Some(ms) => CoordinatorConfig::with_lease_window(Duration::from_millis(ms)),
        None => CoordinatorConfig::default(),
    };
    if let Some(ms) = file_cfg.read_ttl_ms {
        coordinator.read_ttl = Duration::from_millis(ms);
    }
    coordinator.validate()?;

    Ok(Settings {
        db_url,
        device,
        token,
        coordinator,
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    let cli = Cli::parse();
    let settings = resolve_settings(&cli)?;

    info!("Store:   {}", settings.db_url);
    info!("Device:  {}", settings.device);
    if let Some(token) = &settings.token {
        info!(
            "Token:   {}***",
            token.chars().take(4).collect::<String>()
        );
    }

    let store: Arc<dyn DocumentStore> = Arc::new(CouchStore::new(
        &settings.db_url,
        &settings.device,
        settings.token.clone(),
    )?);
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    match cli.command {
        Commands::Status => status(store.as_ref(), clock.as_ref(), &settings.coordinator).await?,
        Commands::Hold => hold(store, clock, settings.coordinator).await?,
        Commands::Mode { mode } => set_mode(store, clock, settings.coordinator, mode).await?,
    }

    Ok(())
}

async fn status(
    store: &dyn DocumentStore,
    clock: &dyn Clock,
    config: &CoordinatorConfig,
) -> anyhow::Result<()> {
    let now = clock.now_ms();

    match store.get(CONTROL_DOC).await {
        Ok(doc) => {
            let lease = LeaseRecord::decode(&doc)?;
            print_lease(&lease, now, config);
        }
        Err(e) if e.is_not_found() => println!("Control lease:  (none, no session has connected yet)"),
        Err(e) => return Err(e.into()),
    }

    println!();
    match store.get(DEVICE_DOC).await {
        Ok(doc) => print_device(&doc),
        Err(e) if e.is_not_found() => println!("Device:         offline (no device document)"),
        Err(e) => return Err(e.into()),
    }

    Ok(())
}

fn print_lease(lease: &LeaseRecord, now: i64, config: &CoordinatorConfig) {
    let issued = lease
        .issued_at_utc()
        .map(|t| t.format("%Y-%m-%d %H:%M:%S%.3f").to_string())
        .unwrap_or_else(|| lease.issued_at.to_string());
    let valid = lease.is_valid_at(now, config.lease_window.as_millis() as u64);

    println!("Owner session:  {}", lease.owner_session_id);
    println!("Fence token:    {}", lease.fence_token);
    println!("Issued at:      {} ({}ms ago)", issued, lease.age_ms(now));
    println!("Valid:          {}", if valid { "yes" } else { "no (expired)" });
    println!("Schema:         {}", lease.schema_version);
    match lease.payload_as::<ControlCommand>() {
        Ok(ControlCommand {
            mode: Some(mode), ..
        }) => println!("Requested mode: {}", mode),
        _ => println!("Requested mode: (unset)"),
    }
}

fn print_device(doc: &Document) {
    println!("Device rev:     {}", doc.revision);
    match doc.decode::<DeviceState>() {
        Ok(state) => {
            println!("Mode:           {}", state.mode);
            if let Some(battery) = state.battery {
                println!("Battery:        {:.0}%", battery);
            }
            if let (Some(lat), Some(lon)) = (state.latitude, state.longitude) {
                println!("Position:       {:.6}, {:.6}", lat, lon);
            }
            if let Some(ack) = &state.control_response {
                println!("Last applied:   session {} fence {}", ack.session_id, ack.v);
            }
        }
        Err(_) => println!("Body:           {}", doc.body),
    }
}

async fn hold(
    store: Arc<dyn DocumentStore>,
    clock: Arc<dyn Clock>,
    config: CoordinatorConfig,
) -> anyhow::Result<()> {
    let coordinator = LeaseCoordinator::connect(store, clock, config).await?;
    let mut roles = coordinator.subscribe();
    println!(
        "Session {} is {}",
        coordinator.session_id(),
        *roles.borrow_and_update()
    );

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            changed = roles.changed() => {
                if changed.is_err() {
                    break;
                }
                let role = *roles.borrow_and_update();
                let lease = coordinator.read_control().await;
                println!("Session {} is {} (fence {})", coordinator.session_id(), role, lease.fence_token);
            }
        }
    }

    coordinator.shutdown().await;
    Ok(())
}

async fn set_mode(
    store: Arc<dyn DocumentStore>,
    clock: Arc<dyn Clock>,
    config: CoordinatorConfig,
    mode: ControlMode,
) -> anyhow::Result<()> {
    let coordinator = LeaseCoordinator::bootstrap(store, clock, config).await?;

    match coordinator
        .write_control(ControlCommand::mode(mode).into_payload())
        .await
    {
        Ok(lease) => {
            println!("Mode set to {} (fence {})", mode, lease.fence_token);
            Ok(())
        }
        Err(e) if e.is_not_owner() => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
        Err(e) => Err(e.into()),
    }
}
