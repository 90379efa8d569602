//! llm-gateway entry point.
//!
//! ## CLI Subcommands
//!
//! - `llm-gateway serve` - Start the gateway and watch model directories (default)
//! - `llm-gateway scan <DIR>` - List model files under a directory
//! - `llm-gateway config show` - Print the effective configuration
//! - `llm-gateway version` / `help`

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use llm_gateway::models::{model_id, DirectoryWatcher};
use llm_gateway::GatewayConfig;

const EXIT_CONFIG: u8 = 2;

#[tokio::main]
async fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().collect();
    let config_path = option_value(&args, &["--config", "-c"]).map(PathBuf::from);
    let positional = positional_args(&args);
    let command = positional.first().map(|s| s.as_str()).unwrap_or("serve");

    match command {
        "serve" => {
            let config = match load_config(config_path.as_deref()) {
                Ok(config) => config,
                Err(code) => return code,
            };
            serve(config).await
        }
        "scan" => {
            let Some(dir) = positional.get(1) else {
                eprintln!("scan needs a directory");
                print_command_help("scan");
                return ExitCode::FAILURE;
            };
            let extension = option_value(&args, &["--ext"]).unwrap_or("gguf");
            scan(Path::new(dir), extension).await
        }
        "config" => {
            let subcommand = positional.get(1).map(|s| s.as_str()).unwrap_or("show");
            match subcommand {
                "show" => {
                    let config = match load_config(config_path.as_deref()) {
                        Ok(config) => config,
                        Err(code) => return code,
                    };
                    match config.to_toml() {
                        Ok(text) => {
                            print!("{text}");
                            ExitCode::SUCCESS
                        }
                        Err(e) => {
                            eprintln!("Failed to render configuration: {e}");
                            ExitCode::FAILURE
                        }
                    }
                }
                _ => {
                    eprintln!("Unknown config subcommand: {}", subcommand);
                    print_command_help("config");
                    ExitCode::FAILURE
                }
            }
        }
        "help" | "--help" | "-h" => {
            if let Some(subcommand) = positional.get(1) {
                print_command_help(subcommand);
            } else {
                print_usage();
            }
            ExitCode::SUCCESS
        }
        "version" | "--version" | "-V" => {
            println!("llm-gateway {}", env!("CARGO_PKG_VERSION"));
            ExitCode::SUCCESS
        }
        _ => {
            eprintln!("Unknown command: {}", command);
            print_usage();
            ExitCode::FAILURE
        }
    }
}

/// Value following any of `names`.
fn option_value<'a>(args: &'a [String], names: &[&str]) -> Option<&'a str> {
    args.iter()
        .position(|arg| names.contains(&arg.as_str()))
        .and_then(|i| args.get(i + 1))
        .map(String::as_str)
}

/// Arguments that are neither options nor option values.
fn positional_args(args: &[String]) -> Vec<String> {
    let mut positional = Vec::new();
    let mut skip_next = false;
    for arg in args.iter().skip(1) {
        if skip_next {
            skip_next = false;
            continue;
        }
        match arg.as_str() {
            "--config" | "-c" | "--ext" => skip_next = true,
            _ => positional.push(arg.clone()),
        }
    }
    positional
}

fn load_config(path: Option<&Path>) -> Result<GatewayConfig, ExitCode> {
    GatewayConfig::load(path).map_err(|e| {
        eprintln!("Configuration error: {e}");
        ExitCode::from(EXIT_CONFIG)
    })
}

async fn scan(dir: &Path, extension: &str) -> ExitCode {
    match DirectoryWatcher::start(dir, extension).await {
        Ok((mut watcher, _events)) => {
            let root = watcher.root().to_path_buf();
            for path in watcher.model_list() {
                println!("{}", model_id(&root, &path));
            }
            watcher.stop();
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("Scan failed: {e}");
            ExitCode::FAILURE
        }
    }
}

#[cfg(feature = "gguf")]
async fn serve(config: GatewayConfig) -> ExitCode {
    use std::sync::Arc;

    use llm_gateway::engine::gguf::GgufBackend;
    use llm_gateway::shutdown::DrainResult;
    use llm_gateway::telemetry::init_logging;
    use llm_gateway::Gateway;
    use tracing::{error, info};

    if let Err(e) = init_logging(&config.log) {
        eprintln!("Logging setup failed: {e}");
        return ExitCode::from(EXIT_CONFIG);
    }

    let backend = match GgufBackend::new((&config.gguf).into()) {
        Ok(backend) => Arc::new(backend),
        Err(e) => {
            error!(error = %e, "backend initialization failed");
            return ExitCode::FAILURE;
        }
    };
    let gateway = match Gateway::start(config, backend).await {
        Ok(gateway) => gateway,
        Err(e) => {
            error!(error = %e, "gateway startup failed");
            return ExitCode::FAILURE;
        }
    };

    for card in gateway.handler().list_models().await.data {
        info!(model_id = %card.id, name = card.name.as_deref().unwrap_or(""), "model available");
    }
    info!(
        roots = gateway.config().model_dirs.len(),
        "gateway ready, watching model directories until Ctrl-C"
    );

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to listen for shutdown signal");
    }
    match gateway.shutdown().await {
        DrainResult::Complete => ExitCode::SUCCESS,
        DrainResult::Timeout { .. } => ExitCode::FAILURE,
    }
}

#[cfg(not(feature = "gguf"))]
async fn serve(_config: GatewayConfig) -> ExitCode {
    eprintln!("This build has no inference backend. Rebuild with --features gguf.");
    ExitCode::FAILURE
}

fn print_usage() {
    let version = env!("CARGO_PKG_VERSION");
    eprintln!(
        "llm-gateway v{}

USAGE:
    llm-gateway [COMMAND] [OPTIONS]

COMMANDS:
    serve        Start the gateway (default when no command given)
    scan DIR     List model files under DIR
    config       Show the effective configuration
    version      Show version information
    help         Show this help message

OPTIONS:
    -c, --config PATH  TOML configuration file
    --ext EXT          Model file extension for scan (default: gguf)
    -h, --help         Show help for command
    -V, --version      Show version information

ENVIRONMENT:
    LLM_GATEWAY_CONFIG      Configuration file when --config is not given
    LLM_GATEWAY_MODEL_DIRS  Model directories, separated like PATH
    LLM_GATEWAY_LOG_LEVEL   Log filter (debug, info, warn, error)

EXIT CODES:
    0  Success
    1  Failure
    2  Configuration error",
        version
    );
}

fn print_command_help(command: &str) {
    match command {
        "serve" => eprintln!(
            "llm-gateway serve [--config PATH]

Load configuration, discover models in every model directory and keep
watching them until Ctrl-C. Requires the gguf feature."
        ),
        "scan" => eprintln!(
            "llm-gateway scan DIR [--ext EXT]

Print the id of every model file under DIR, one per line."
        ),
        "config" => eprintln!(
            "llm-gateway config show [--config PATH]

Print defaults merged with the configuration file and LLM_GATEWAY_* overrides."
        ),
        _ => print_usage(),
    }
}
