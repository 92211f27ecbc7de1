//! Pageflow serving-core entry point.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use colored::Colorize;
use tracing::{info, warn};

use pageflow_core::{AttentionKind, EngineConfig};
use pageflow_engine::model::UniformModel;
use pageflow_engine::Engine;
use pageflow_ipc::IpcConfig;
use pageflow_metrics::{init_metrics, init_tracing, LogFormat, TracingConfig};
use pageflow_tokenizer::HfTokenizer;

/// Flipped by the signal handler; a watcher thread propagates it to the
/// engine's shutdown flag.
static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);

/// Pageflow, the paged-attention LLM serving core.
#[derive(Parser, Debug)]
#[command(
    name = "pageflow",
    version,
    about = "Paged-attention LLM serving core with a shared-memory transport"
)]
struct Cli {
    /// Path to the model directory (weights, tokenizer.json).
    #[arg(long)]
    model: PathBuf,

    /// Attention mechanism (standard, paged).
    #[arg(long, default_value = "standard")]
    attention: String,

    /// Number of KV cache pages to allocate.
    #[arg(long = "kv-pages", default_value_t = 8192)]
    kv_pages: usize,

    /// Maximum number of sequences to process concurrently.
    #[arg(long = "max-seqs", default_value_t = 256)]
    max_seqs: usize,

    /// Maximum number of tokens per batch.
    #[arg(long = "max-tokens", default_value_t = 4096)]
    max_tokens: usize,

    /// Evict the newest decode sequence under page exhaustion.
    #[arg(long)]
    preempt: bool,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long = "log-level", default_value = "info", env = "LOG_LEVEL")]
    log_level: String,

    /// Log format (pretty, compact, json).
    #[arg(long = "log-format", default_value = "pretty", env = "LOG_FORMAT")]
    log_format: String,
}

fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            // --help and --version print and exit cleanly; real usage
            // errors exit with the configuration-error code.
            let code = if err.use_stderr() { 1 } else { 0 };
            let _ = err.print();
            std::process::exit(code);
        }
    };

    if let Err(err) = run(cli) {
        eprintln!("{} {err:#}", "fatal:".bright_red().bold());
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    let level = cli
        .log_level
        .parse()
        .unwrap_or(tracing::Level::INFO);
    init_tracing(TracingConfig {
        level,
        format: LogFormat::parse(&cli.log_format),
    })
    .context("failed to initialize tracing")?;
    if let Err(err) = init_metrics() {
        warn!(%err, "metrics collector unavailable");
    }

    if LogFormat::parse(&cli.log_format) != LogFormat::Json {
        print_banner();
    }

    let attention: AttentionKind = cli.attention.parse()?;
    let config = EngineConfig {
        model_path: cli.model.clone(),
        attention,
        num_kv_pages: cli.kv_pages,
        max_num_seqs: cli.max_seqs,
        max_tokens_in_batch: cli.max_tokens,
        preempt_decodes: cli.preempt,
    };
    config.validate()?;

    info!(
        model = %config.model_path.display(),
        attention = %config.attention,
        kv_pages = config.num_kv_pages,
        max_seqs = config.max_num_seqs,
        max_tokens = config.max_tokens_in_batch,
        "starting engine"
    );

    let tokenizer = Arc::new(
        HfTokenizer::from_pretrained(&config.model_path)
            .context("failed to load tokenizer")?,
    );

    // The tensor backend is an external collaborator; until one is wired in,
    // the uniform placeholder carries the structural metadata that sizes the
    // pool.
    let model = Box::new(UniformModel::new(32, 8, 128, tokenizer.vocab_size()));

    let engine = Engine::new(config, IpcConfig::default(), model, tokenizer)
        .context("engine initialization failed")?;

    install_signal_handlers().context("failed to install signal handlers")?;
    spawn_shutdown_watcher(engine.shutdown_flag());

    engine.run_blocking().context("engine run failed")?;
    info!("clean exit");
    Ok(())
}

extern "C" fn handle_signal(_signal: libc::c_int) {
    // Async-signal-safe: a single relaxed store, nothing else.
    SHUTDOWN_REQUESTED.store(true, Ordering::Relaxed);
}

fn install_signal_handlers() -> Result<()> {
    // SAFETY: the handler only stores to an atomic, and the sigaction call
    // sequence follows the documented libc contract.
    let handler = handle_signal as extern "C" fn(libc::c_int);
    unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = handler as usize;
        libc::sigemptyset(&mut action.sa_mask);
        for signal in [libc::SIGINT, libc::SIGTERM] {
            if libc::sigaction(signal, &action, std::ptr::null_mut()) != 0 {
                return Err(std::io::Error::last_os_error())
                    .with_context(|| format!("sigaction({signal})"));
            }
        }
    }
    Ok(())
}

/// Bridges the async-signal-safe static to the engine's shutdown flag.
fn spawn_shutdown_watcher(flag: Arc<AtomicBool>) {
    std::thread::Builder::new()
        .name("pageflow-signals".to_string())
        .spawn(move || loop {
            if SHUTDOWN_REQUESTED.load(Ordering::Relaxed) {
                info!("shutdown signal received");
                flag.store(true, Ordering::Release);
                return;
            }
            std::thread::sleep(Duration::from_millis(50));
        })
        .ok();
}

fn print_banner() {
    println!(
        "\n  {} {} - {}\n",
        "Pageflow".bright_green().bold(),
        env!("CARGO_PKG_VERSION").bright_yellow(),
        "paged-attention serving core".white()
    );
}
