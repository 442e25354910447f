//! CLI binary for edgequake-derivatives.
//!
//! A thin shim over the library crate that maps CLI flags to a
//! `StorageConfig` and a generator, then prints the resulting URIs.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use edgequake_derivatives::{
    CopyStep, DerivationObserver, Generator, GeneratorBuilder, HocrStep, Location, MonochromeStep,
    Observer, OutputExtension, PdfiumSplitter, Promotion, Registry, RenderOptions, Rewrite,
    SplitFormat, SplitGenerator, StorageConfig, ThumbnailStep,
};
use indicatif::{ProgressBar, ProgressStyle};
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
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

// ── CLI observer using indicatif ─────────────────────────────────────────────

/// Spinner plus one log line per input, saying which tier answered.
struct CliObserver {
    bar: ProgressBar,
    built: AtomicUsize,
    found: AtomicUsize,
    started: Instant,
}

impl CliObserver {
    fn new() -> Arc<Self> {
        let bar = ProgressBar::new_spinner();
        let style = ProgressStyle::with_template("{spinner:.cyan} {prefix:.bold}  {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"]);
        bar.set_style(style);
        bar.set_prefix("Resolving");
        bar.enable_steady_tick(Duration::from_millis(80));

        Arc::new(Self {
            bar,
            built: AtomicUsize::new(0),
            found: AtomicUsize::new(0),
            started: Instant::now(),
        })
    }

    fn line(&self, mark: String, input: &Location, output: &Location, tier: &str) {
        self.bar.println(format!(
            "  {mark} {}  {}  {}",
            input,
            dim(&format!("→ {output}")),
            dim(tier)
        ));
    }
}

impl DerivationObserver for CliObserver {
    fn on_generator_start(&self, generator: &str, inputs: usize) {
        self.bar.set_prefix(generator.to_string());
        self.bar.println(format!(
            "{} {}",
            cyan("◆"),
            bold(&format!("{generator}: {inputs} input(s)"))
        ));
    }

    fn on_found_at_destination(&self, input: &Location, destination: &Location) {
        self.found.fetch_add(1, Ordering::Relaxed);
        self.line(green("✓"), input, destination, "destination");
    }

    fn on_found_preprocessed(&self, input: &Location, preprocessed: &Location) {
        self.found.fetch_add(1, Ordering::Relaxed);
        self.line(green("✓"), input, preprocessed, "preprocessed");
    }

    fn on_build_start(&self, input: &Location, _destination: &Location) {
        self.bar.set_message(format!("building {}", input.file_name()));
    }

    fn on_build_complete(&self, input: &Location, output: &Location) {
        self.built.fetch_add(1, Ordering::Relaxed);
        self.line(cyan("+"), input, output, "built");
    }

    fn on_generator_complete(&self, generator: &str, outputs: usize) {
        self.bar.println(format!(
            "{} {generator}: {outputs} output(s)  {}",
            green("✔"),
            dim(&format!(
                "{} found, {} built, {:.1}s",
                self.found.load(Ordering::Relaxed),
                self.built.load(Ordering::Relaxed),
                self.started.elapsed().as_secs_f64()
            ))
        ));
    }
}

impl Drop for CliObserver {
    fn drop(&mut self) {
        self.bar.finish_and_clear();
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # OCR local scans, writing hOCR beside a derived tree
  derivatives derive hocr \
    --input file:///scans/box-1/page-1.tiff \
    --output-template 'file:///derived/{{dir_parts[-1..-1]}}/{{basename}}{{extension}}'

  # Reuse derivatives produced by an earlier batch job in S3
  derivatives derive thumbnail --input file:///scans/a.pdf \
    --output-template 'file:///derived/{{basename}}{{extension}}' \
    --preprocessed-template 's3://pre.s3.us-east-1.amazonaws.com/{{basename}}{{extension}}'

  # Split a PDF into PNG pages
  derivatives derive split --split-format png --input file:///scans/a.pdf \
    --output-template 'file:///pages/{{basename}}{{extension}}'

  # Preview a template rewrite
  derivatives rewrite file:///a/b/c/file.pdf 'file:///out/{{dir_parts[-2..-1]}}/{{basename}}{{extension}}' --extension hocr

TEMPLATE PLACEHOLDERS:
  {{ dir_parts[a..b] }}   source directory segments a..=b (negative from the end)
  {{ filename }}          source file name
  {{ basename }}          file name without extension (and without .mono)
  {{ extension }}         generator output extension
  {{ scheme }}            target scheme

ENVIRONMENT VARIABLES:
  AWS_S3_BUCKET, AWS_S3_REGION, AWS_S3_ACCESS_KEY_ID, AWS_S3_SECRET_ACCESS_KEY
  AWS_SQS_QUEUE, AWS_SQS_REGION, AWS_SQS_ACCOUNT_ID, AWS_SQS_BATCH_SIZE
  AWS_<NAME> and AWS_DEFAULT_<NAME> are used when the prefixed form is unset.
  PDFIUM_LIB_PATH         Path to libpdfium (file or directory)
  RUST_LOG                tracing filter, overrides --verbose/--quiet
"#;

/// Find or build file derivatives across local disk, S3, SQS and HTTP.
#[derive(Parser, Debug)]
#[command(
    name = "derivatives",
    version,
    about = "Find or build file derivatives across local disk, S3, SQS and HTTP",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// S3 bucket used when creating s3 locations.
    #[arg(long, global = true)]
    s3_bucket: Option<String>,

    /// S3 region.
    #[arg(long, global = true)]
    s3_region: Option<String>,

    /// SQS queue name.
    #[arg(long, global = true)]
    sqs_queue: Option<String>,

    /// SQS account id.
    #[arg(long, global = true)]
    sqs_account_id: Option<String>,

    /// Messages per SQS batch.
    #[arg(long, global = true)]
    sqs_batch_size: Option<usize>,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, global = true, env = "DERIVATIVES_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors and results.
    #[arg(short, long, global = true, env = "DERIVATIVES_QUIET")]
    quiet: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Find or build one kind of derivative for each input.
    Derive(DeriveArgs),

    /// Print the URI a template rewrites a source URI to.
    Rewrite {
        /// Source URI.
        uri: String,
        /// Output template.
        template: String,
        /// Target scheme for `{{ scheme }}`.
        #[arg(long)]
        scheme: Option<String>,
        /// Output extension for `{{ extension }}`; the source's when unset.
        #[arg(long)]
        extension: Option<String>,
    },

    /// List the registered storage schemes.
    Schemes,
}

#[derive(Args, Debug)]
struct DeriveArgs {
    /// Kind of derivative.
    #[arg(value_enum)]
    generator: GeneratorArg,

    /// Input URI; repeat for several.
    #[arg(short, long = "input", required = true)]
    inputs: Vec<String>,

    /// Template for the destination URI.
    #[arg(short, long)]
    output_template: String,

    /// Template for a location filled by an earlier batch job.
    #[arg(short, long)]
    preprocessed_template: Option<String>,

    /// Return preprocessed hits where they are instead of copying them to the destination.
    #[arg(long)]
    no_promote: bool,

    /// Page image format for `split`.
    #[arg(long, value_enum, default_value = "tiff")]
    split_format: SplitFormatArg,

    /// Rendering DPI for PDF pages.
    #[arg(long, default_value_t = 400,
          value_parser = clap::value_parser!(u32).range(72..=1200))]
    dpi: u32,

    /// Environment for tesseract, e.g. "OMP_THREAD_LIMIT=1 TESSDATA_PREFIX=/opt/tessdata".
    #[arg(long, env = "DERIVATIVES_TESSERACT_ENV")]
    tesseract_env: Option<String>,

    /// Extra tesseract options, e.g. "-l deu".
    #[arg(long, allow_hyphen_values = true)]
    tesseract_args: Option<String>,

    /// Print results as JSON.
    #[arg(long)]
    json: bool,

    /// Disable the progress spinner.
    #[arg(long, env = "DERIVATIVES_NO_PROGRESS")]
    no_progress: bool,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum GeneratorArg {
    Copy,
    Monochrome,
    Thumbnail,
    Hocr,
    Split,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum SplitFormatArg {
    Tiff,
    Png,
    Jpeg,
}

impl From<SplitFormatArg> for SplitFormat {
    fn from(v: SplitFormatArg) -> Self {
        match v {
            SplitFormatArg::Tiff => SplitFormat::Tiff,
            SplitFormatArg::Png => SplitFormat::Png,
            SplitFormatArg::Jpeg => SplitFormat::Jpeg,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet {
        "error"
    } else {
        "warn"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    match &cli.command {
        Command::Rewrite {
            uri,
            template,
            scheme,
            extension,
        } => {
            let extension = extension.as_deref().map(OutputExtension::literal);
            let out = Rewrite::new(uri, template)
                .target_scheme(scheme.as_deref())
                .extension(extension.as_ref())
                .apply()
                .context("Rewrite failed")?;
            println!("{out}");
            Ok(())
        }
        Command::Schemes => {
            let registry = build_registry(&cli)?;
            for scheme in registry.schemes() {
                println!("{scheme}");
            }
            Ok(())
        }
        Command::Derive(args) => derive(&cli, args).await,
    }
}

/// Map CLI args to `StorageConfig`; flags win over the environment.
fn build_registry(cli: &Cli) -> Result<Registry> {
    let mut builder = StorageConfig::builder_from_env().context("Invalid AWS environment")?;
    if let Some(bucket) = &cli.s3_bucket {
        builder = builder.s3_bucket(bucket);
    }
    if let Some(region) = &cli.s3_region {
        builder = builder.s3_region(region);
    }
    if let Some(queue) = &cli.sqs_queue {
        builder = builder.sqs_queue(queue);
    }
    if let Some(account) = &cli.sqs_account_id {
        builder = builder.sqs_account_id(account);
    }
    if let Some(n) = cli.sqs_batch_size {
        builder = builder.sqs_batch_size(n);
    }
    let config = builder.build().context("Invalid configuration")?;
    Registry::with_defaults(config).context("Failed to set up storage backends")
}

async fn derive(cli: &Cli, args: &DeriveArgs) -> Result<()> {
    let registry = build_registry(cli)?;
    let show_progress = !cli.quiet && !args.no_progress && !args.json;
    let observer: Option<Observer> = if show_progress {
        Some(CliObserver::new() as Observer)
    } else {
        None
    };
    let promotion = if args.no_promote {
        Promotion::UsePreprocessed
    } else {
        Promotion::CopyToDestination
    };
    let render = RenderOptions {
        dpi: args.dpi,
        ..RenderOptions::default()
    };

    let uris = match args.generator {
        GeneratorArg::Split => {
            let mut builder = SplitGenerator::builder(PdfiumSplitter::new(render))
                .format(args.split_format.into())
                .inputs(args.inputs.iter().cloned())
                .output_template(&args.output_template)
                .promotion(promotion);
            if let Some(pre) = &args.preprocessed_template {
                builder = builder.preprocessed_template(pre);
            }
            if let Some(observer) = observer {
                builder = builder.observer(observer);
            }
            builder
                .build(&registry)
                .context("Invalid split request")?
                .evaluated_uris()
                .await
                .context("Split failed")?
        }
        GeneratorArg::Copy => {
            run(Generator::builder(CopyStep), args, &registry, promotion, observer).await?
        }
        GeneratorArg::Monochrome => {
            run(Generator::builder(MonochromeStep), args, &registry, promotion, observer).await?
        }
        GeneratorArg::Thumbnail => {
            let builder = Generator::builder(ThumbnailStep::new(render));
            run(builder, args, &registry, promotion, observer).await?
        }
        GeneratorArg::Hocr => {
            let builder = Generator::builder(hocr_step(args)?).requires(MonochromeStep);
            run(builder, args, &registry, promotion, observer).await?
        }
    };

    if args.json {
        let json = serde_json::json!({
            "generator": format!("{:?}", args.generator).to_lowercase(),
            "inputs": args.inputs,
            "outputs": uris,
        });
        println!(
            "{}",
            serde_json::to_string_pretty(&json).context("Failed to serialise output")?
        );
    } else {
        for uri in &uris {
            println!("{uri}");
        }
    }
    Ok(())
}

async fn run(
    builder: GeneratorBuilder,
    args: &DeriveArgs,
    registry: &Registry,
    promotion: Promotion,
    observer: Option<Observer>,
) -> Result<Vec<String>> {
    let mut builder = builder
        .inputs(args.inputs.iter().cloned())
        .output_template(&args.output_template)
        .promotion(promotion);
    if let Some(pre) = &args.preprocessed_template {
        builder = builder.preprocessed_template(pre);
    }
    if let Some(observer) = observer {
        builder = builder.observer(observer);
    }
    builder
        .build(registry)
        .context("Invalid derivation request")?
        .evaluated_uris()
        .await
        .context("Derivation failed")
}

fn hocr_step(args: &DeriveArgs) -> Result<HocrStep> {
    let mut step = HocrStep::default();
    if let Some(env) = &args.tesseract_env {
        step = step.env_string(env).context("Invalid --tesseract-env")?;
    }
    if let Some(extra) = &args.tesseract_args {
        step = step.extra_args(extra.split_whitespace());
    }
    Ok(step)
}
