#![recursion_limit = "256"]
#![expect(
    clippy::multiple_crate_versions,
    reason = "transitive dependency duplication"
)]

use clap::{Parser, Subcommand};
use dapp_signer::{
    config::ConfigStore,
    crypto::KeyPair,
    paths::DappSignerPaths,
    resilience::analyze_failure,
};
use eyre::Context as _;
use std::io::Write as _;
use tracing_subscriber::prelude::*;

#[derive(Parser, Debug)]
#[command(name = "dapp-signer", version)]
struct Cli {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Generate a session key pair and print its public key (SPKI hex).
    ///
    /// The private half is discarded; this is a quick check that the platform RNG and P-256
    /// backend work.
    Keygen,

    /// Classify a transaction failure message and print the analysis as JSON.
    Classify {
        /// Error message as reported by the bundler or node.
        message: String,

        /// Optional JSON-RPC / provider error code.
        #[arg(long, allow_negative_numbers = true)]
        code: Option<i64>,
    },

    /// Load `config.toml` (writing defaults on first run) and validate it.
    CheckConfig {
        /// Emit JSON to stdout (machine-readable).
        #[arg(long, default_value_t = false)]
        json: bool,
    },

    /// Print resolved paths (useful for debugging).
    Paths,
}

fn init_logging(paths: &DappSignerPaths) -> tracing_appender::non_blocking::WorkerGuard {
    let env_filter = tracing_subscriber::EnvFilter::from_default_env();
    let file_name = paths
        .log_file
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("dapp-signer.log.jsonl");
    let file_appender = tracing_appender::rolling::never(&paths.data_dir, file_name);
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    let stderr_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(std::io::stderr)
        .with_filter(env_filter.clone());
    let file_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(file_writer)
        .with_filter(env_filter);

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(file_layer)
        .init();

    guard
}

fn print_line(s: &str) -> eyre::Result<()> {
    writeln!(std::io::stdout().lock(), "{s}").context("write stdout")
}

fn check_config(paths: &DappSignerPaths, json: bool) -> eyre::Result<()> {
    let cfg = ConfigStore::new(paths)
        .load_or_init_default()
        .context("load config")?;
    let verdict = cfg.resilience.validate();

    if json {
        let report = serde_json::json!({
            "ok": verdict.is_ok(),
            "version": env!("CARGO_PKG_VERSION"),
            "config_file": paths.config_file(),
            "keys_url": cfg.preference.keys_url,
            "wallet_rpc_url": cfg.wallet_rpc_url,
            "sub_accounts": cfg.sub_accounts,
            "resilience": cfg.resilience,
            "error": verdict.as_ref().err().map(ToString::to_string),
        });
        let s = serde_json::to_string_pretty(&report).context("serialize config report")?;
        print_line(&s)?;
    } else {
        print_line(&format!("config: {}", paths.config_file().display()))?;
        print_line(&format!("keys url: {}", cfg.preference.keys_url))?;
        print_line(&format!("wallet rpc: {}", cfg.wallet_rpc_url))?;
        match &verdict {
            Ok(()) => print_line("resilience: ok")?,
            Err(e) => print_line(&format!("resilience: {e}"))?,
        }
    }

    verdict.context("invalid resilience config")
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();

    let paths = DappSignerPaths::discover()?;
    paths.ensure_private_dirs().context("create app dirs")?;
    let _log_guard = init_logging(&paths);

    match cli.cmd {
        Command::Keygen => {
            let keys = KeyPair::generate().context("generate session key")?;
            print_line(&keys.public_key_hex().context("export public key")?)
        }
        Command::Classify { message, code } => {
            let analysis = analyze_failure(&message, code);
            tracing::debug!(failure_type = %analysis.failure_type, "classified");
            let s = serde_json::to_string_pretty(&analysis).context("serialize analysis")?;
            print_line(&s)
        }
        Command::CheckConfig { json } => check_config(&paths, json),
        Command::Paths => {
            let s = serde_json::to_string(&serde_json::json!({
              "config_dir": paths.config_dir,
              "data_dir": paths.data_dir,
              "log_file": paths.log_file,
              "store_file": paths.store_file(),
            }))
            .context("serialize paths")?;
            print_line(&s)
        }
    }
}
