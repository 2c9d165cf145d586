use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::debug;

use funcbox::config::FuncboxConfig;
use funcbox::registry::types::ParameterSchema;
use funcbox::{Envelope, FunctionService, UploadRequest};

#[derive(Parser)]
#[command(name = "funcbox", about = "Upload, version, and run sandboxed functions.")]
struct Cli {
    /// YAML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Directory for the write-ahead log (overrides the config file)
    #[arg(short, long, global = true)]
    data_dir: Option<PathBuf>,

    /// Execution timeout in seconds
    #[arg(long, global = true)]
    timeout: Option<f64>,

    /// Memory ceiling in bytes
    #[arg(long, global = true)]
    memory: Option<usize>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Validate a source file without storing it
    Check { file: PathBuf },
    /// Store a source file as the next version of a function
    Upload {
        name: String,
        file: PathBuf,
        #[arg(long, default_value = "")]
        description: String,
        /// JSON file with the parameter schema
        #[arg(long)]
        schema: Option<PathBuf>,
    },
    /// Run a function
    Exec {
        name: String,
        #[arg(long)]
        version: Option<u32>,
        /// Parameters as a JSON object
        #[arg(long, default_value = "{}")]
        params: String,
    },
    /// List stored functions
    List,
    /// List the versions of a function
    Versions { name: String },
    /// Show the execution history of a function
    History { name: String },
    /// Make a stored version the active one
    Activate { name: String, version: u32 },
    /// Remove a function and its history
    Delete { name: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("funcbox=info".parse()?),
        )
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;
    debug!(?config, "configuration loaded");

    let service = FunctionService::open(config)?;
    let envelope = run(&service, cli.command).await?;
    drop(service);

    println!("{}", serde_json::to_string_pretty(&envelope)?);
    if envelope.is_failure() {
        std::process::exit(1);
    }
    Ok(())
}

fn load_config(cli: &Cli) -> Result<FuncboxConfig> {
    let mut config = match &cli.config {
        Some(path) => FuncboxConfig::load(path)?,
        None => FuncboxConfig::default(),
    };
    if let Some(dir) = &cli.data_dir {
        config.storage.data_dir = Some(dir.clone());
    }
    if let Some(timeout) = cli.timeout {
        config.sandbox.timeout_secs = timeout;
    }
    if let Some(memory) = cli.memory {
        config.sandbox.memory_limit_bytes = memory;
    }
    config.check()?;
    Ok(config)
}

fn read_file(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))
}

async fn run(service: &FunctionService, command: Command) -> Result<Envelope> {
    let envelope: Envelope = match command {
        Command::Check { file } => {
            let violations = service.check(&read_file(&file)?);
            Envelope::success(serde_json::json!({
                "accepted": violations.is_empty(),
                "violations": violations,
            }))
        }
        Command::Upload {
            name,
            file,
            description,
            schema,
        } => {
            let parameters: ParameterSchema = match schema {
                Some(path) => serde_json::from_str(&read_file(&path)?)
                    .with_context(|| format!("invalid schema in {}", path.display()))?,
                None => ParameterSchema::new(),
            };
            let request = UploadRequest {
                name,
                source: read_file(&file)?,
                description,
                parameters,
            };
            match service.upload(request).await {
                Ok(version) => Envelope::uploaded(&version),
                Err(e) => Envelope::failure(&e),
            }
        }
        Command::Exec {
            name,
            version,
            params,
        } => {
            let params: serde_json::Value =
                serde_json::from_str(&params).context("--params must be valid JSON")?;
            service.execute(&name, version, &params).await.into()
        }
        Command::List => Envelope::success(serde_json::to_value(service.list())?),
        Command::Versions { name } => match service.versions(&name) {
            Ok(versions) => Envelope::success(serde_json::to_value(versions)?),
            Err(e) => Envelope::failure(&e),
        },
        Command::History { name } => match service.history(&name) {
            Ok(records) => Envelope::success(serde_json::to_value(records)?),
            Err(e) => Envelope::failure(&e),
        },
        Command::Activate { name, version } => match service.activate(&name, version).await {
            Ok(summary) => Envelope::success(serde_json::to_value(summary)?),
            Err(e) => Envelope::failure(&e),
        },
        Command::Delete { name } => match service.delete(&name).await {
            Ok(()) => Envelope::success(serde_json::json!({ "deleted": name })),
            Err(e) => Envelope::failure(&e),
        },
    };
    Ok(envelope)
}
