//! CLI binary for cardproxy-engine.
//!
//! A thin shim over the library crate: registers each input image, runs one
//! processing batch through the engine and writes the export rasters.

use anyhow::{Context, Result};
use cardproxy_engine::pipeline::fetch::is_url;
use cardproxy_engine::{
    BleedWidth, CacheStats, CardEntry, DarkenMode, EngineConfig, ImageError, ImageId, Priority,
    ProcessOutcome, ProcessingObserver, ProcessingSettings, ProxyEngine, SourceDescriptor,
    TransformParams,
};
use clap::Parser;
use futures::future::join_all;
use indicatif::{ProgressBar, ProgressStyle};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
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

const TICKS: &[&str] = &["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"];

// ── CLI progress observer using indicatif ────────────────────────────────────

/// Renders a live progress bar and one log line per finished image. Images
/// complete out of order, so start times are tracked per id.
struct CliProgress {
    bar: ProgressBar,
    names: Mutex<HashMap<ImageId, String>>,
    start_times: Mutex<HashMap<ImageId, Instant>>,
    errors: AtomicUsize,
}

impl CliProgress {
    fn new() -> Arc<Self> {
        let bar = ProgressBar::new(0);
        let spinner_style = ProgressStyle::with_template("{spinner:.cyan} {prefix:.bold}  {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(TICKS);
        bar.set_style(spinner_style);
        bar.set_prefix("Preparing");
        bar.set_message("Registering images…");
        bar.enable_steady_tick(Duration::from_millis(80));

        Arc::new(Self {
            bar,
            names: Mutex::new(HashMap::new()),
            start_times: Mutex::new(HashMap::new()),
            errors: AtomicUsize::new(0),
        })
    }

    fn set_name(&self, id: &ImageId, name: &str) {
        self.names.lock().insert(id.clone(), name.to_string());
    }

    fn label(&self, id: &ImageId) -> String {
        self.names
            .lock()
            .get(id)
            .cloned()
            .unwrap_or_else(|| id.short().to_string())
    }

    fn elapsed(&self, id: &ImageId) -> String {
        let ms = self
            .start_times
            .lock()
            .remove(id)
            .map(|t| t.elapsed().as_millis())
            .unwrap_or(0);
        dim(&format!("{:.1}s", ms as f64 / 1000.0))
    }
}

impl ProcessingObserver for CliProgress {
    fn on_batch_start(&self, total_cards: usize) {
        let style = ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold}  \
             [{bar:42.green/238}] {pos:>3}/{len} images  \
             ⏱ {elapsed_precise}  ETA {eta_precise}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ")
        .tick_strings(TICKS);

        self.bar.set_length(total_cards as u64);
        self.bar.set_style(style);
        self.bar.set_prefix("Processing");
        self.bar.reset_eta();
        self.bar.println(format!(
            "{} {}",
            cyan("◆"),
            bold(&format!("Processing {total_cards} images…"))
        ));
    }

    fn on_job_started(&self, id: &ImageId, params: &TransformParams, _priority: Priority) {
        self.start_times.lock().insert(id.clone(), Instant::now());
        self.bar.set_message(format!("{} @ {}", self.label(id), params));
    }

    fn on_already_current(&self, id: &ImageId) {
        self.bar.println(format!(
            "  {} {:<32}  {}",
            green("✓"),
            self.label(id),
            dim("cached")
        ));
        self.bar.inc(1);
    }

    fn on_processed(&self, id: &ImageId, params: &TransformParams, _elapsed: Duration) {
        self.bar.println(format!(
            "  {} {:<32}  {:<18}  {}",
            green("✓"),
            self.label(id),
            dim(&params.to_string()),
            self.elapsed(id),
        ));
        self.bar.inc(1);
    }

    fn on_failed(&self, id: &ImageId, error: &ImageError) {
        self.errors.fetch_add(1, Ordering::SeqCst);
        let error = error.to_string();
        // Keep the log tidy.
        let msg = if error.chars().count() > 80 {
            format!("{}\u{2026}", error.chars().take(79).collect::<String>())
        } else {
            error
        };
        self.bar.println(format!(
            "  {} {:<32}  {}  {}",
            red("✗"),
            self.label(id),
            red(&msg),
            self.elapsed(id),
        ));
        self.bar.inc(1);
    }

    fn on_batch_complete(&self, stats: &CacheStats) {
        self.bar.finish_and_clear();
        let failed = self.errors.load(Ordering::SeqCst);
        let done = stats.images_processed + stats.already_correct;
        if failed == 0 {
            eprintln!(
                "{} {} images ready",
                green("✔"),
                bold(&done.to_string())
            );
        } else {
            eprintln!(
                "{} {}/{} images ready  ({} failed)",
                if done == 0 { red("✘") } else { cyan("⚠") },
                bold(&done.to_string()),
                done + failed,
                red(&failed.to_string()),
            );
        }
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Process two local scans at 300 DPI, no bleed
  cardproxy bolt.png counterspell.jpg -o print/

  # 2 mm bleed, darkened, 4 copies each
  cardproxy --bleed 2 --darken --copies 4 art/*.png -o print/

  # Remote art, higher print resolution
  cardproxy --dpi 600 https://cards.example/img/bolt.png -o print/

  # Machine-readable stats
  cardproxy --json deck/*.png > stats.json

CACHE:
  Sources and derived rasters live under --cache-dir. Re-running with the
  same settings is served entirely from the cache; changing --dpi, --bleed
  or --darken regenerates only what changed. Images no run has used for
  --keep-days are removed when the cache is next opened.

ENVIRONMENT VARIABLES:
  CARDPROXY_CACHE_DIR   Cache directory (default: .cardproxy-cache)
  RUST_LOG              Override log filter (e.g. cardproxy_engine=debug)
"#;

/// Turn card art into print-ready proxy rasters.
#[derive(Parser, Debug)]
#[command(
    name = "cardproxy",
    version,
    about = "Turn card art into print-ready proxy rasters with bleed",
    long_about = "Fetch or load card images, extend them with mirrored bleed, resample them to the \
print DPI and optionally darken them. Results are cached by content so repeated runs only redo \
what changed.",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// Local image files (PNG/JPEG) or HTTP/HTTPS URLs.
    #[arg(required = true)]
    inputs: Vec<String>,

    /// Write export PNGs into this directory.
    #[arg(short, long, env = "CARDPROXY_OUTPUT")]
    output: Option<PathBuf>,

    /// Cache directory for sources and derived rasters.
    #[arg(long, env = "CARDPROXY_CACHE_DIR", default_value = ".cardproxy-cache")]
    cache_dir: PathBuf,

    /// Print resolution (72–1200).
    #[arg(long, env = "CARDPROXY_DPI", default_value_t = 300,
          value_parser = clap::value_parser!(u32).range(72..=1200))]
    dpi: u32,

    /// Bleed width in millimetres added on every edge.
    #[arg(long, env = "CARDPROXY_BLEED", default_value_t = 0.0, value_parser = parse_bleed)]
    bleed: f64,

    /// Apply the darken tone map to export rasters.
    #[arg(long, env = "CARDPROXY_DARKEN")]
    darken: bool,

    /// Card slots referencing each input.
    #[arg(long, default_value_t = 1,
          value_parser = clap::value_parser!(u32).range(1..))]
    copies: u32,

    /// Concurrent transform workers.
    #[arg(short, long, env = "CARDPROXY_WORKERS", default_value_t = 4)]
    workers: usize,

    /// Days an image no run references stays in the cache.
    #[arg(long, env = "CARDPROXY_KEEP_DAYS", default_value_t = 30)]
    keep_days: u64,

    /// HTTP fetch timeout in seconds.
    #[arg(long, env = "CARDPROXY_FETCH_TIMEOUT", default_value_t = 60)]
    fetch_timeout: u64,

    /// Output structured JSON (stats and per-image results).
    #[arg(long)]
    json: bool,

    /// Disable progress bar.
    #[arg(long, env = "CARDPROXY_NO_PROGRESS")]
    no_progress: bool,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, env = "CARDPROXY_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, env = "CARDPROXY_QUIET")]
    quiet: bool,
}

#[derive(Serialize)]
struct ImageReport {
    input: String,
    id: ImageId,
    #[serde(skip_serializing_if = "Option::is_none")]
    output: Option<PathBuf>,
    regenerated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<ImageError>,
}

#[derive(Serialize)]
struct RunReport {
    stats: CacheStats,
    images: Vec<ImageReport>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    // The progress bar replaces INFO-level library logs.
    let show_progress = !cli.quiet && !cli.no_progress && !cli.json;
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet || show_progress {
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

    // ── Build engine ─────────────────────────────────────────────────────
    let progress = show_progress.then(CliProgress::new);
    let mut builder = EngineConfig::builder()
        .workers(cli.workers)
        .release_grace(Duration::from_secs(cli.keep_days.saturating_mul(24 * 60 * 60)))
        .fetch_timeout_secs(cli.fetch_timeout);
    if let Some(ref p) = progress {
        builder = builder.observer(Arc::clone(p) as Arc<dyn ProcessingObserver>);
    }
    let config = builder.build().context("Invalid configuration")?;

    let engine = ProxyEngine::open_dir(config, &cli.cache_dir)
        .await
        .with_context(|| format!("Failed to open cache at {}", cli.cache_dir.display()))?;

    let darken = if cli.darken {
        DarkenMode::Darken
    } else {
        DarkenMode::Off
    };
    let settings = ProcessingSettings::default()
        .with_dpi(cli.dpi)
        .with_bleed(BleedWidth::from_mm(cli.bleed))
        .with_darken(darken);

    // ── Register + process ───────────────────────────────────────────────
    let mut cards = Vec::new();
    let result = run_batch(&cli, &engine, &settings, progress.as_deref(), &mut cards).await;
    // This run's slots go away with the process; the records stay cached
    // for --keep-days and are revived by the next run that needs them.
    release_inputs(&engine, &cards, cli.copies).await;
    let (stats, images) = result?;

    // ── Report ───────────────────────────────────────────────────────────
    if cli.json {
        let json = serde_json::to_string_pretty(&RunReport {
            stats: stats.clone(),
            images,
        })
        .context("Failed to serialise report")?;
        println!("{json}");
    } else if !cli.quiet {
        if !show_progress {
            eprintln!("{}", stats.summary());
            for image in images.iter().filter(|i| i.error.is_some()) {
                if let Some(ref e) = image.error {
                    eprintln!("  {} {}", red("✗"), e);
                }
            }
        }
        if let Some(ref dir) = cli.output {
            eprintln!(
                "   {}  {} network fetches  {}ms total",
                bold(&dir.display().to_string()),
                dim(&stats.network_fetches.to_string()),
                stats.elapsed_ms,
            );
        }
    }

    if !cards.is_empty() && stats.images_failed == cards.len() {
        anyhow::bail!("All {} images failed", cards.len());
    }
    Ok(())
}

/// Register every input, process the batch and write the exports.
///
/// Each registered card is pushed onto `cards` as soon as its references
/// are acquired, so the caller can release them even when this fails.
async fn run_batch(
    cli: &Cli,
    engine: &ProxyEngine,
    settings: &ProcessingSettings,
    progress: Option<&CliProgress>,
    cards: &mut Vec<(String, CardEntry)>,
) -> Result<(CacheStats, Vec<ImageReport>)> {
    register_inputs(engine, &cli.inputs, cli.copies, cards, |id, name| {
        if let Some(p) = progress {
            p.set_name(id, name);
        }
    })
    .await?;

    engine.begin_batch(cards.len());
    let outcomes = join_all(
        cards
            .iter()
            .map(|(_, card)| engine.ensure_processed(card, settings, Priority::High)),
    )
    .await;

    let mut images = Vec::with_capacity(cards.len());
    let mut write_error = None;
    for ((input, card), outcome) in cards.iter().zip(outcomes) {
        let mut report = ImageReport {
            input: input.clone(),
            id: card.image_id.clone(),
            output: None,
            regenerated: false,
            error: None,
        };
        match outcome {
            Ok(outcome) => {
                report.regenerated = outcome.was_regenerated();
                if let (Some(dir), None) = (&cli.output, &write_error) {
                    match write_export(engine, dir, card, &outcome).await {
                        Ok(path) => report.output = Some(path),
                        Err(e) => write_error = Some(e),
                    }
                }
            }
            Err(e) => report.error = Some(e),
        }
        images.push(report);
    }
    let stats = engine.finish_batch();
    match write_error {
        Some(e) => Err(e),
        None => Ok((stats, images)),
    }
}

/// Acquire `copies` references per distinct input and name its card.
///
/// Inputs resolving to an already registered image are skipped without
/// acquiring anything. Card names are file stems, suffixed with the short
/// image id when two different inputs share a stem.
async fn register_inputs(
    engine: &ProxyEngine,
    inputs: &[String],
    copies: u32,
    cards: &mut Vec<(String, CardEntry)>,
    on_named: impl Fn(&ImageId, &str),
) -> Result<()> {
    let mut seen = HashSet::new();
    let mut names = HashSet::new();
    for input in inputs {
        let source = load_source(input).await?;
        let id = source
            .image_id()
            .with_context(|| format!("Failed to identify {input}"))?;
        if seen.contains(&id) {
            tracing::warn!("{} is a duplicate of an earlier input, skipping", input);
            continue;
        }
        engine
            .acquire_image(source, copies)
            .await
            .with_context(|| format!("Failed to register {input}"))?;
        seen.insert(id.clone());

        let mut name = card_name(input);
        if !names.insert(name.clone()) {
            name = format!("{name}-{}", id.short());
            names.insert(name.clone());
        }
        on_named(&id, &name);
        cards.push((input.clone(), CardEntry::new(id, name)));
    }
    Ok(())
}

/// Drop the references [`register_inputs`] acquired.
async fn release_inputs(engine: &ProxyEngine, cards: &[(String, CardEntry)], copies: u32) {
    for (input, card) in cards {
        for _ in 0..copies {
            if let Err(e) = engine.release_reference(&card.image_id).await {
                tracing::warn!("Failed to release {}: {}", input, e);
                break;
            }
        }
    }
}

/// Bleed in millimetres: finite and not negative.
fn parse_bleed(s: &str) -> Result<f64, String> {
    let mm: f64 = s
        .trim()
        .parse()
        .map_err(|_| format!("'{s}' is not a number"))?;
    if !mm.is_finite() || mm < 0.0 {
        return Err(format!("bleed must be a non-negative number of millimetres, got {s}"));
    }
    Ok(mm)
}

/// Build a source descriptor for a path or URL argument.
async fn load_source(input: &str) -> Result<SourceDescriptor> {
    if is_url(input) {
        return Ok(SourceDescriptor::url(input));
    }
    let path = Path::new(input);
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let mut source = SourceDescriptor::upload(bytes);
    if let Some(name) = path.file_name() {
        source = source.with_file_name(name.to_string_lossy());
    }
    Ok(source)
}

/// Display name for an input: file stem, or the last URL path segment.
fn card_name(input: &str) -> String {
    let last = input
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or(input);
    let last = last.split(['?', '#']).next().unwrap_or(last);
    match Path::new(last).file_stem() {
        Some(stem) if !stem.is_empty() => stem.to_string_lossy().into_owned(),
        _ => "card".to_string(),
    }
}

/// Write the committed export raster of `card` into `dir`.
///
/// Uses atomic write (temp file + rename) to prevent partial files.
async fn write_export(
    engine: &ProxyEngine,
    dir: &Path,
    card: &CardEntry,
    outcome: &ProcessOutcome,
) -> Result<PathBuf> {
    let id = &outcome.record().id;
    let png = engine
        .load_export(id)
        .await
        .with_context(|| format!("Failed to read export of {}", card.name))?
        .with_context(|| format!("No export stored for {}", card.name))?;

    tokio::fs::create_dir_all(dir)
        .await
        .with_context(|| format!("Failed to create {}", dir.display()))?;
    let path = dir.join(format!("{}.png", card.name));
    let tmp_path = path.with_extension("png.tmp");
    tokio::fs::write(&tmp_path, &png)
        .await
        .with_context(|| format!("Failed to write {}", tmp_path.display()))?;
    tokio::fs::rename(&tmp_path, &path)
        .await
        .with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use cardproxy_engine::{HttpFetcher, MemoryBlobStore, SourceFetcher};

    async fn engine() -> ProxyEngine {
        let config = EngineConfig::builder()
            .release_grace(Duration::from_secs(3600))
            .build()
            .unwrap();
        let fetcher: Arc<dyn SourceFetcher> = Arc::new(HttpFetcher::new(5).unwrap());
        ProxyEngine::open(config, Arc::new(MemoryBlobStore::new()), fetcher)
            .await
            .unwrap()
    }

    fn write_input(dir: &Path, rel: &str, bytes: &[u8]) -> String {
        let path = dir.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, bytes).unwrap();
        path.to_string_lossy().into_owned()
    }

    #[tokio::test]
    async fn repeated_runs_do_not_accumulate_references() {
        let dir = tempfile::tempdir().unwrap();
        let inputs = vec![write_input(dir.path(), "bolt.png", b"bolt art")];
        let engine = engine().await;

        for _ in 0..2 {
            let mut cards = Vec::new();
            register_inputs(&engine, &inputs, 3, &mut cards, |_, _| {})
                .await
                .unwrap();
            let id = cards[0].1.image_id.clone();
            assert_eq!(engine.ref_count(&id), Some(3));

            release_inputs(&engine, &cards, 3).await;
            assert_eq!(engine.ref_count(&id), Some(0));
            assert!(engine.registry().is_pending_release(&id));
        }
    }

    #[tokio::test]
    async fn duplicate_input_acquires_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let inputs = vec![
            write_input(dir.path(), "a/bolt.png", b"same art"),
            write_input(dir.path(), "b/copy.png", b"same art"),
        ];
        let engine = engine().await;

        let mut cards = Vec::new();
        register_inputs(&engine, &inputs, 2, &mut cards, |_, _| {})
            .await
            .unwrap();
        assert_eq!(cards.len(), 1);
        assert_eq!(engine.ref_count(&cards[0].1.image_id), Some(2));
    }

    #[tokio::test]
    async fn same_stem_gets_distinct_names() {
        let dir = tempfile::tempdir().unwrap();
        let inputs = vec![
            write_input(dir.path(), "a/bolt.png", b"alpha print"),
            write_input(dir.path(), "b/bolt.png", b"beta print"),
        ];
        let engine = engine().await;

        let mut cards = Vec::new();
        register_inputs(&engine, &inputs, 1, &mut cards, |_, _| {})
            .await
            .unwrap();
        let second = &cards[1].1;
        assert_eq!(cards[0].1.name, "bolt");
        assert_eq!(second.name, format!("bolt-{}", second.image_id.short()));
    }

    #[test]
    fn bleed_must_be_non_negative() {
        assert_eq!(parse_bleed("2.5"), Ok(2.5));
        assert_eq!(parse_bleed("0"), Ok(0.0));
        assert!(parse_bleed("-1").is_err());
        assert!(parse_bleed("NaN").is_err());
        assert!(parse_bleed("two").is_err());
    }

    #[test]
    fn card_name_uses_stem_or_url_segment() {
        assert_eq!(card_name("art/bolt.png"), "bolt");
        assert_eq!(card_name("https://cards.example/img/bolt.jpg?size=large"), "bolt");
    }
}
