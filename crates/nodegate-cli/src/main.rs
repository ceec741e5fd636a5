//! Command-line interface for the nodegate device gateway.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use nodegate_core::config::env_vars;
use nodegate_core::GatewayConfig;
use nodegate_devices::catalog::read_schema_file;
use nodegate_devices::{
    ChannelKind, ChannelUpdate, DeviceSchema, Gateway, LayeredSchemaSource, MemoryTransport,
    MqttTransport, SchemaCatalog, SchemaSource, StoredSchemaSource, Transport,
};
use nodegate_storage::StoredSchemaDocument;

/// nodegate - schema-driven gateway for constrained devices.
#[derive(Parser, Debug)]
#[command(name = "nodegate")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Action to perform.
    #[command(subcommand)]
    command: Command,

    /// TOML configuration file.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Directory of schema documents (overrides the configuration).
    #[arg(long, global = true)]
    schema_dir: Option<PathBuf>,

    /// redb schema store (overrides the configuration).
    #[arg(long, global = true)]
    schema_store: Option<PathBuf>,

    /// Verbose output.
    #[arg(short, long, global = true)]
    verbose: bool,
}

/// Available commands.
#[derive(Subcommand, Debug)]
enum Command {
    /// Connect to the broker and serve devices.
    Serve {
        /// Print every gateway event as a JSON line.
        #[arg(long)]
        print_events: bool,
    },
    /// Schema document management.
    Schema {
        #[command(subcommand)]
        schema_cmd: SchemaCommand,
    },
    /// Validate a command and publish it to one device.
    Command {
        /// Target device id.
        device: String,
        /// Channel values as a JSON object, e.g. '{"temp": 21}'.
        channels: String,
        /// Device type whose schema the command is checked against.
        #[arg(short = 't', long)]
        device_type: String,
        /// Print the message instead of publishing it.
        #[arg(long)]
        dry_run: bool,
    },
}

/// Schema subcommands.
#[derive(Subcommand, Debug)]
enum SchemaCommand {
    /// Check a schema document.
    Validate {
        /// Path to the JSON document.
        #[arg(required = true)]
        path: PathBuf,
    },
    /// Validate a document and store it.
    Import {
        /// Path to the JSON document.
        #[arg(required = true)]
        path: PathBuf,
    },
    /// List known device types.
    List,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);

    let mut config = GatewayConfig::load(args.config.as_deref())?;
    if let Some(dir) = args.schema_dir {
        config.schemas.dir = Some(dir);
    }
    if let Some(store) = args.schema_store {
        config.schemas.store_path = Some(store);
    }

    match args.command {
        Command::Serve { print_events } => run_server(config, print_events).await,
        Command::Schema { schema_cmd } => run_schema_cmd(&config, schema_cmd).await,
        Command::Command {
            device,
            channels,
            device_type,
            dry_run,
        } => send_command(&config, &device, &channels, &device_type, dry_run).await,
    }
}

fn init_logging(verbose: bool) {
    let json_logging = std::env::var(env_vars::LOG_JSON)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(false);

    let default_level = if verbose { "debug" } else { "info" };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!(
            "nodegate={0},nodegate_devices={0},nodegate_storage={0},warn",
            default_level
        ))
    });

    // Logs go to stderr; stdout carries command output.
    if json_logging {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .compact()
            .with_writer(std::io::stderr)
            .init();
    }
}

/// Build the schema source chain: directory catalog first, then the store.
fn build_schema_source(config: &GatewayConfig) -> Result<Arc<dyn SchemaSource>> {
    let mut layered = LayeredSchemaSource::new();

    if let Some(dir) = &config.schemas.dir {
        let catalog = SchemaCatalog::new();
        catalog
            .load_dir(dir)
            .with_context(|| format!("Failed to load schemas from {}", dir.display()))?;
        layered = layered.with_layer(Arc::new(catalog));
    }
    if let Some(path) = &config.schemas.store_path {
        let stored = open_store(path)?;
        layered = layered.with_layer(Arc::new(stored));
    }

    if layered.is_empty() {
        if config.provisioning.accept_declared_channels {
            tracing::warn!(
                "No schema directory or store configured; only devices that declare their channels can provision"
            );
        } else {
            tracing::warn!(
                "No schema directory or store configured; every provisioning request will be rejected"
            );
        }
    }
    Ok(Arc::new(layered))
}

fn open_store(path: &Path) -> Result<StoredSchemaSource> {
    StoredSchemaSource::open(path)
        .with_context(|| format!("Failed to open schema store {}", path.display()))
}

async fn run_server(config: GatewayConfig, print_events: bool) -> Result<()> {
    let schemas = build_schema_source(&config)?;
    let transport = Arc::new(MqttTransport::connect(&config.mqtt)?);

    let gateway = Gateway::builder(transport.clone(), schemas)
        .with_config(&config)
        .build();

    if print_events {
        let mut events = gateway.events().subscribe();
        tokio::spawn(async move {
            while let Some((event, _)) = events.recv().await {
                match serde_json::to_string(&event) {
                    Ok(line) => println!("{}", line),
                    Err(e) => tracing::warn!("Failed to encode event: {}", e),
                }
            }
        });
    }

    gateway
        .run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for ctrl-c: {}", e);
                std::future::pending::<()>().await;
            }
        })
        .await?;

    transport.shutdown().await;
    Ok(())
}

async fn run_schema_cmd(config: &GatewayConfig, cmd: SchemaCommand) -> Result<()> {
    match cmd {
        SchemaCommand::Validate { path } => {
            let schema = read_schema_file(&path)
                .with_context(|| format!("Invalid schema document {}", path.display()))?;
            println!("Schema Validation: PASSED");
            println!();
            print_schema(&schema);
            Ok(())
        }

        SchemaCommand::Import { path } => {
            let store_path = config.schemas.store_path.as_deref().with_context(|| {
                format!(
                    "No schema store configured (use --schema-store or {})",
                    env_vars::SCHEMA_STORE
                )
            })?;
            let schema = read_schema_file(&path)
                .with_context(|| format!("Invalid schema document {}", path.display()))?;
            let record = open_store(store_path)?.publish(&schema).await?;
            println!(
                "Imported '{}' (revision {}) into {}",
                record.device_type,
                record.revision,
                store_path.display()
            );
            Ok(())
        }

        SchemaCommand::List => {
            let mut found = 0;

            if let Some(dir) = &config.schemas.dir {
                let catalog = SchemaCatalog::new();
                catalog
                    .load_dir(dir)
                    .with_context(|| format!("Failed to load schemas from {}", dir.display()))?;
                println!("Directory {}", dir.display());
                for device_type in catalog.device_types() {
                    if let Some(schema) = catalog.get(&device_type) {
                        println!("  {:<24} {} channel(s)", device_type, schema.len());
                        found += 1;
                    }
                }
            }

            if let Some(path) = &config.schemas.store_path {
                let stored = open_store(path)?;
                println!("Store {}", path.display());
                for record in stored.store().list()? {
                    print_record(&record);
                    found += 1;
                }
            }

            if found == 0 {
                println!("No schemas found.");
            } else {
                println!();
                println!("Total: {} schema(s)", found);
            }
            Ok(())
        }
    }
}

fn print_schema(schema: &DeviceSchema) {
    println!("Device type:     {}", schema.device_type());
    println!("Channels:        {}", schema.len());
    for channel in schema.channels() {
        let rules = match &channel.kind {
            ChannelKind::Number(bounds) => {
                let mut parts = Vec::new();
                if let Some(min) = bounds.minimum {
                    parts.push(format!("min {}", min));
                }
                if let Some(max) = bounds.maximum {
                    parts.push(format!("max {}", max));
                }
                if let Some(step) = bounds.multiple_of {
                    parts.push(format!("step {}", step));
                }
                parts.join(", ")
            }
            ChannelKind::Choice(options) => options.iter().cloned().collect::<Vec<_>>().join("|"),
            ChannelKind::Bool | ChannelKind::String => String::new(),
        };
        println!(
            "  {:<16} {:<7} {:<8} {}",
            channel.name,
            channel.kind.channel_type(),
            if channel.commandable { "command" } else { "" },
            rules
        );
    }
}

fn print_record(record: &StoredSchemaDocument) {
    let channels = record
        .document
        .get("channels")
        .and_then(|c| c.as_object())
        .map_or(0, |c| c.len());
    println!(
        "  {:<24} {} channel(s), revision {}",
        record.device_type, channels, record.revision
    );
}

async fn send_command(
    config: &GatewayConfig,
    device_id: &str,
    channels: &str,
    device_type: &str,
    dry_run: bool,
) -> Result<()> {
    let value: serde_json::Value =
        serde_json::from_str(channels).context("Channels must be a JSON object")?;
    let serde_json::Value::Object(map) = value else {
        anyhow::bail!("Channels must be a JSON object, got: {}", channels);
    };
    let update = ChannelUpdate::from_channels(map);

    let schema = build_schema_source(config)?
        .resolve_schema(device_type)
        .await?;

    let memory = Arc::new(MemoryTransport::new());
    let mqtt = if dry_run {
        None
    } else {
        Some(Arc::new(MqttTransport::connect(&config.mqtt)?))
    };
    let transport: Arc<dyn Transport> = match &mqtt {
        Some(mqtt) => mqtt.clone(),
        None => memory.clone(),
    };

    // A one-off gateway whose registry knows only the target device.
    let gateway = Gateway::builder(transport, Arc::new(SchemaCatalog::new()))
        .with_config(config)
        .build();
    gateway.registry().get_or_create(device_id).await;
    gateway.registry().bind_schema(device_id, schema).await?;

    let sent = gateway.send_command(device_id, &update).await?;

    match mqtt {
        Some(mqtt) => {
            // Let the event loop flush the publish before disconnecting.
            tokio::time::sleep(Duration::from_millis(500)).await;
            mqtt.shutdown().await;
            println!(
                "Published {} channel(s) to {}",
                sent.len(),
                gateway.topics().command(device_id)
            );
        }
        None => {
            for message in memory.published().await {
                println!("{}", message.topic);
                println!("{}", String::from_utf8_lossy(&message.payload));
            }
        }
    }
    Ok(())
}
