//! Ergon CLI - Run agent scripts in the sandbox from the command line

mod fixture;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use ergon_core::prelude::*;
use serde_json::Value;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "ergon")]
#[command(about = "Ergon sandboxed script runner", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file (defaults to ergon.toml and ERGON_* variables)
    #[arg(short, long, global = true, env = "ERGON_CONFIG_PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a script against fixture capabilities
    Run {
        /// Script file, or `-` for stdin
        script: PathBuf,

        /// Capability fixture file (JSON)
        #[arg(short, long)]
        fixtures: Option<PathBuf>,

        /// Prefix the result with one line per capability call
        #[arg(long)]
        trace: bool,

        /// Wall-clock budget in milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,

        /// Memory ceiling in MiB
        #[arg(long)]
        memory_mb: Option<u64>,

        /// Discard console output from the script
        #[arg(long)]
        quiet_console: bool,

        /// Abort when a capability result object has this key set to true
        #[arg(long, value_name = "KEY")]
        abort_on: Option<String>,
    },
    /// List the capabilities defined by a fixture file
    Capabilities {
        /// Capability fixture file (JSON)
        fixtures: PathBuf,
    },
    /// Print the resolved configuration
    Config,
    /// Version information
    Version,
}

/// Aborts the invocation when a result object carries `key: true`
struct AbortOnKey {
    key: String,
}

impl InspectionCallback for AbortOnKey {
    fn inspect(&self, _capability: &str, value: &Value, _arguments: &Value) -> ResultSignal {
        if value.get(&self.key) == Some(&Value::Bool(true)) {
            ResultSignal::abort(value.clone())
        } else {
            ResultSignal::proceed(value.clone())
        }
    }
}

fn load_config(path: Option<&Path>) -> Result<ErgonConfig> {
    let config = match path {
        Some(path) => ErgonConfig::from_file(path)?,
        None => ErgonConfig::load()?,
    };
    Ok(config)
}

fn read_script(path: &Path) -> Result<String> {
    if path.as_os_str() == "-" {
        let mut script = String::new();
        std::io::stdin()
            .read_to_string(&mut script)
            .context("Failed to read script from stdin")?;
        return Ok(script);
    }
    std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read script {}", path.display()))
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Version => {
            println!("ergon {}", env!("CARGO_PKG_VERSION"));
            println!("ergon-core {}", ergon_core::VERSION);
        }
        Commands::Config => {
            let config = load_config(cli.config.as_deref())?;
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
        Commands::Capabilities { fixtures } => {
            let table = fixture::load(&fixtures)?;
            for summary in table.summaries() {
                if summary.identifier == summary.name {
                    println!("{}: {}", summary.name, summary.description);
                } else {
                    println!(
                        "{} (as {}): {}",
                        summary.name, summary.identifier, summary.description
                    );
                }
            }
        }
        Commands::Run {
            script,
            fixtures,
            trace,
            timeout_ms,
            memory_mb,
            quiet_console,
            abort_on,
        } => {
            let mut sandbox = load_config(cli.config.as_deref())?.sandbox;
            if let Some(timeout_ms) = timeout_ms {
                sandbox = sandbox.with_timeout_ms(timeout_ms);
            }
            if let Some(memory_mb) = memory_mb {
                sandbox = sandbox.with_memory_ceiling_bytes(memory_mb.saturating_mul(1024 * 1024));
            }
            if quiet_console {
                sandbox = sandbox.with_console_forwarding(false);
            }
            sandbox.validate()?;

            let source = read_script(&script)?;
            let capabilities = match fixtures {
                Some(path) => fixture::load(path)?,
                None => CapabilityTable::new(),
            };
            tracing::debug!(
                script = %script.display(),
                capabilities = capabilities.len(),
                timeout_ms = sandbox.timeout_ms,
                "Running script"
            );

            let mut executor = CodeExecutor::new(sandbox);
            if let Some(key) = abort_on {
                executor = executor.with_inspector(Arc::new(AbortOnKey { key }));
            }

            match executor
                .execute(&source, &capabilities, trace.then_some(true))
                .await
            {
                Ok(text) => println!("{}", text),
                Err(err) => {
                    println!("{}", err);
                    std::process::exit(1);
                }
            }
        }
    }

    Ok(())
}
