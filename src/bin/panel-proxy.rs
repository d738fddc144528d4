//! CLI binary for panel-proxy.
//!
//! A thin shim over the library crate that maps CLI flags
//! to `ProxyConfig`, runs one batch and prints the response.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use panel_proxy::{
    content_type_for, process_chapter, process_urls, Dispatched, ProgressCallback, ProxyConfig,
    ProxyError, ProxyProgressCallback, WaveReport, CACHE_CONTROL,
};
use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}
fn cyan(s: &str) -> String {
    format!("\x1b[36m{s}\x1b[0m")
}

// ── CLI progress callback using indicatif ────────────────────────────────────

/// Terminal progress callback: one bar for the whole batch, disclosed and
/// background images alike. Images complete out of order, so start times
/// are tracked per index.
struct CliProgressCallback {
    bar: ProgressBar,
    start_times: Mutex<HashMap<usize, Instant>>,
    errors: AtomicUsize,
}

impl CliProgressCallback {
    fn new_dynamic() -> Arc<Self> {
        let bar = ProgressBar::new(0);
        let spinner_style = ProgressStyle::with_template("{spinner:.cyan} {prefix:.bold}  {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"]);

        bar.set_style(spinner_style);
        bar.set_prefix("Preparing");
        bar.set_message("Resolving batch…");
        bar.enable_steady_tick(Duration::from_millis(80));

        Arc::new(Self {
            bar,
            start_times: Mutex::new(HashMap::new()),
            errors: AtomicUsize::new(0),
        })
    }

    fn activate_bar(&self, total: usize) {
        let progress_style = ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold}  \
             [{bar:42.green/238}] {pos:>3}/{len} images  \
             ⏱ {elapsed_precise}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ")
        .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"]);

        self.bar.set_length(total as u64);
        self.bar.set_style(progress_style);
        self.bar.set_prefix("Processing");
    }

    fn elapsed_secs(&self, index: usize) -> f64 {
        self.start_times
            .lock()
            .unwrap()
            .remove(&index)
            .map(|t| t.elapsed().as_secs_f64())
            .unwrap_or(0.0)
    }
}

impl ProxyProgressCallback for CliProgressCallback {
    fn on_batch_start(&self, total_images: usize) {
        self.activate_bar(total_images);
        self.bar.println(format!(
            "{} {}",
            cyan("◆"),
            bold(&format!("Processing {total_images} images…"))
        ));
    }

    fn on_image_start(&self, index: usize, _total: usize) {
        self.start_times
            .lock()
            .unwrap()
            .insert(index, Instant::now());
        self.bar.set_message(format!("image {}", index + 1));
    }

    fn on_image_complete(&self, index: usize, total: usize, skipped: bool) {
        let secs = self.elapsed_secs(index);
        self.bar.println(format!(
            "  {} Image {:>3}/{:<3}  {:<8}  {}",
            green("✓"),
            index + 1,
            total,
            dim(if skipped { "cached" } else { "stored" }),
            dim(&format!("{secs:.1}s")),
        ));
        self.bar.inc(1);
    }

    fn on_image_error(&self, index: usize, total: usize, error: &str) {
        let secs = self.elapsed_secs(index);
        self.errors.fetch_add(1, Ordering::SeqCst);

        let msg = if error.chars().count() > 80 {
            format!("{}\u{2026}", error.chars().take(79).collect::<String>())
        } else {
            error.to_string()
        };

        self.bar.println(format!(
            "  {} Image {:>3}/{:<3}  {}  {}",
            red("✗"),
            index + 1,
            total,
            red(&msg),
            dim(&format!("{secs:.1}s")),
        ));
        self.bar.inc(1);
    }

    fn on_disclosed(&self, disclosed: usize, total_images: usize) {
        if disclosed == total_images {
            self.bar.finish_and_clear();
            return;
        }
        self.bar.println(format!(
            "{} {}",
            cyan("◆"),
            bold(&format!(
                "{disclosed}/{total_images} ready, remaining images continue in background"
            ))
        ));
    }

    fn on_background_complete(&self, report: &WaveReport) {
        self.bar.finish_and_clear();
        let errors = self.errors.load(Ordering::SeqCst);
        if errors > report.failed.len() {
            eprintln!(
                "{} {} image(s) failed before the response was sent",
                cyan("⚠"),
                errors - report.failed.len()
            );
        }
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Proxy an explicit list of pages
  panel-proxy urls https://img.example.org/c/1.jpg https://img.example.org/c/2.jpg

  # Resolve a chapter through the at-home API
  panel-proxy chapter 0b5b8a5c-5d3a-4f7a-9f2e-1c2d3e4f5a6b

  # Wait for a cached artifact the way the file endpoint does
  panel-proxy artifact 3f2a9c/1.png

POLICY (fixed):
  Webtoon         height / width > 1.6
  Disclosure      webtoon: until 3500 px cumulative height; paged: 2 images
  Paged images    trimmed against white (threshold 40), WebP q75 effort 6

ENVIRONMENT VARIABLES:
  PANEL_PROXY_DATA_DIR     Cache root (default ./data)
  SITE                     Public origin used in returned URLs
  PANEL_PROXY_API_BASE     Chapter API origin
  PANEL_PROXY_CONCURRENCY  Images in flight per batch
  RUST_LOG                 Log filter override
"#;

/// Fetch, compact and cache comic page images.
#[derive(Parser, Debug)]
#[command(
    name = "panel-proxy",
    version,
    about = "Fetch, compact and cache comic page images",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug)]
struct GlobalArgs {
    /// Cache root directory.
    #[arg(long, global = true, env = "PANEL_PROXY_DATA_DIR", default_value = "data")]
    data_dir: PathBuf,

    /// Public origin prefixed to every returned URL.
    #[arg(long, global = true, env = "SITE", default_value = "http://localhost:3000")]
    site: String,

    /// Chapter API origin.
    #[arg(
        long,
        global = true,
        env = "PANEL_PROXY_API_BASE",
        default_value = "https://api.mangadex.org"
    )]
    api_base: String,

    /// Images in flight per batch (1–64).
    #[arg(short, long, global = true, env = "PANEL_PROXY_CONCURRENCY", default_value_t = 5)]
    concurrency: usize,

    /// Per-request upstream timeout in seconds.
    #[arg(long, global = true, env = "PANEL_PROXY_FETCH_TIMEOUT", default_value_t = 30)]
    fetch_timeout: u64,

    /// How long `artifact` waits for a file, in milliseconds.
    #[arg(long, global = true, env = "PANEL_PROXY_ARTIFACT_WAIT", default_value_t = 10_000)]
    artifact_wait: u64,

    /// Disable progress bar.
    #[arg(long, global = true, env = "PANEL_PROXY_NO_PROGRESS")]
    no_progress: bool,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, global = true, env = "PANEL_PROXY_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors and the JSON response.
    #[arg(short, long, global = true, env = "PANEL_PROXY_QUIET")]
    quiet: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Process an ordered list of source image URLs.
    Urls {
        #[arg(required = true)]
        urls: Vec<String>,
    },
    /// Resolve a chapter id upstream and process its pages.
    Chapter { id: String },
    /// Wait for a cached artifact and print where it is.
    Artifact { path: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let g = &cli.global;

    // ── Logging setup ────────────────────────────────────────────────────
    // The bar already reports every image; keep library INFO logs out of it.
    let is_batch = !matches!(cli.command, Command::Artifact { .. });
    let show_progress = is_batch && !g.quiet && !g.no_progress;
    let filter = if g.verbose {
        "debug"
    } else if g.quiet || show_progress {
        "error"
    } else {
        "info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    let progress_cb: Option<ProgressCallback> = if show_progress {
        let cb = CliProgressCallback::new_dynamic();
        Some(cb as Arc<dyn ProxyProgressCallback>)
    } else {
        None
    };
    let config = build_config(g, progress_cb)?;

    match &cli.command {
        Command::Urls { urls } => {
            let started = Instant::now();
            let dispatched = report_fatal(process_urls(urls.as_slice(), &config).await)?;
            finish_batch(dispatched, g.quiet, started).await
        }
        Command::Chapter { id } => {
            let started = Instant::now();
            let dispatched = report_fatal(process_chapter(id, &config).await)?;
            finish_batch(dispatched, g.quiet, started).await
        }
        Command::Artifact { path } => {
            let store = config.cache_store();
            let found = store
                .wait_for_artifact(path)
                .await
                .context("Invalid artifact path")?;
            match found {
                Some(file) => {
                    println!("Path:           {}", file.display());
                    println!("Content-Type:   {}", content_type_for(&file));
                    println!("Cache-Control:  {CACHE_CONTROL}");
                    Ok(())
                }
                None => anyhow::bail!(
                    "Artifact '{}' did not appear within {}ms",
                    path,
                    config.artifact_wait_timeout_ms
                ),
            }
        }
    }
}

/// Print the error body a caller of the HTTP surface would see, then fail.
fn report_fatal(result: Result<Dispatched, ProxyError>) -> Result<Dispatched> {
    match result {
        Ok(d) => Ok(d),
        Err(e) => {
            println!("{}", e.error_body());
            Err(anyhow::Error::new(e).context("Batch failed"))
        }
    }
}

/// Print the response, then stay alive until the background wave drains.
async fn finish_batch(dispatched: Dispatched, quiet: bool, started: Instant) -> Result<()> {
    let json = serde_json::to_string_pretty(&dispatched.response)
        .context("Failed to serialise response")?;
    println!("{json}");

    let disclosed_ms = started.elapsed().as_millis();
    let Some(wave) = dispatched.background else {
        if !quiet {
            eprintln!("{} all images ready in {}ms", green("✔"), disclosed_ms);
        }
        return Ok(());
    };

    let pending = wave.len();
    let report = wave.join().await.context("Background wave did not finish")?;
    if !quiet {
        let failed = report.failed.len();
        eprintln!(
            "{}  response after {}ms, {} background images in {}ms",
            if failed == 0 { green("✔") } else { cyan("⚠") },
            disclosed_ms,
            pending,
            started.elapsed().as_millis(),
        );
        eprintln!(
            "   {} processed  /  {} cached  /  {} failed",
            dim(&report.processed.to_string()),
            dim(&report.skipped.to_string()),
            if failed == 0 {
                dim("0")
            } else {
                red(&failed.to_string())
            },
        );
        for (filename, error) in &report.failed {
            eprintln!("   {} {}: {}", red("✗"), filename, error);
        }
    }
    Ok(())
}

/// Map CLI args to `ProxyConfig`.
fn build_config(g: &GlobalArgs, progress: Option<ProgressCallback>) -> Result<ProxyConfig> {
    let mut builder = ProxyConfig::builder()
        .data_root(g.data_dir.clone())
        .site_origin(g.site.clone())
        .api_base_url(g.api_base.clone())
        .concurrency(g.concurrency)
        .fetch_timeout_secs(g.fetch_timeout)
        .artifact_wait_timeout_ms(g.artifact_wait);

    if let Some(cb) = progress {
        builder = builder.progress_callback(cb);
    }

    builder.build().context("Invalid configuration")
}
