//! Heartrate MQTT demonstration client - main entry point
//!
//! Connects to the broker over mutual TLS, publishes one heartrate reading
//! after a delay, prints whatever arrives on the topic and disconnects on
//! Ctrl-C.

use clap::{Parser, Subcommand};
use heartrate_mqtt::config::{load_env_file, AppConfig};
use heartrate_mqtt::dispatcher::LoggingDispatcher;
use heartrate_mqtt::error::{AppError, AppResult};
use heartrate_mqtt::lifecycle::{LifecycleController, LifecycleSettings};
use heartrate_mqtt::observability::init_default_logging;
use heartrate_mqtt::tls::TlsContext;
use heartrate_mqtt::transport::mqtt::{MqttSession, SessionConfiguration};
use std::path::PathBuf;
use std::process;
use tokio::signal;
use tracing::{error, info, warn};

/// MQTT over mutual TLS heartrate demonstration client
#[derive(Parser)]
#[command(name = "heartrate-mqtt")]
#[command(about = "Publish a heartrate reading over MQTT with mutual TLS and print what comes back")]
#[command(version)]
struct Cli {
    /// Environment file providing HOST, ROOT_PEM, PUB_CERT and PRIV_KEY
    #[arg(long, value_name = "FILE", default_value = ".env", env = "HEARTRATE_ENV_FILE")]
    env_file: PathBuf,

    /// Verbose logging, repeat for more
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect, publish, subscribe and wait for Ctrl-C (default)
    Run,
    /// Inspect the resolved configuration
    Config {
        /// Print the configuration as TOML
        #[arg(long)]
        show: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Loaded before logging so LOG_* variables may come from the file
    let env_loaded = load_env_file(&cli.env_file);

    init_default_logging(cli.verbose);

    if let Err(e) = env_loaded {
        error!("{}", e);
        process::exit(1);
    }

    let result = match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run().await,
        Commands::Config { show } => handle_config_command(show),
    };

    if let Err(e) = &result {
        error!("{}", e);
    }
    process::exit(exit_code(&result));
}

/// Ctrl-C followed by a clean disconnect is a success
fn exit_code(result: &AppResult<()>) -> i32 {
    match result {
        Ok(()) => 0,
        Err(_) => 1,
    }
}

async fn run() -> AppResult<()> {
    let config = AppConfig::from_env()?;
    info!(
        "Starting heartrate-mqtt v{} against {}",
        env!("CARGO_PKG_VERSION"),
        config.broker_url()?
    );

    let tls = TlsContext::load(&config.credentials)?;
    info!(
        roots = tls.root_count(),
        chain = tls.client_chain().len(),
        "TLS context ready"
    );

    let session = MqttSession::connect(
        SessionConfiguration::from_app_config(&config, tls),
        LoggingDispatcher::stdout().into_shared(),
    )
    .await
    .map_err(AppError::Connect)?;

    let mut controller =
        LifecycleController::new(session, LifecycleSettings::from_app_config(&config));

    if let Err(e) = controller.start().await {
        controller.shutdown().await;
        return Err(e.into());
    }

    controller.run_until(wait_for_interrupt()).await?;
    info!("Shutdown complete");
    Ok(())
}

async fn wait_for_interrupt() {
    if let Err(e) = signal::ctrl_c().await {
        // Without a signal handler there is no way to stop cleanly
        warn!("Failed to listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
}

fn handle_config_command(show: bool) -> AppResult<()> {
    let config = AppConfig::from_env()?;

    if show {
        match toml::to_string_pretty(&config) {
            Ok(rendered) => println!("{rendered}"),
            Err(e) => warn!("Failed to render configuration: {}", e),
        }
    }

    info!("Configuration is valid ({})", config.broker_url()?);
    Ok(())
}
