use anyhow::{bail, Context};
use clap::Parser;
use classical_cv::core_modules::frame::save_png;
use classical_cv::{status_for, Category, DispatchPool, Dispatcher, DispatcherConfig, ParamSpec, ParameterSet};
use futures::future::join_all;
use image::DynamicImage;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// Runs classical computer-vision algorithms on an image file.
#[derive(Parser, Debug)]
#[command(name = "cv_tester", version)]
struct Cli {
    /// Image to read.
    #[arg(required_unless_present = "list")]
    input: Option<PathBuf>,

    /// Where to write the result. With `--all`, the stem of this path is suffixed
    /// with each algorithm's name.
    #[arg(required_unless_present = "list")]
    output: Option<PathBuf>,

    /// Category, e.g. "Edge Detection".
    #[arg(long, short, required_unless_present = "list")]
    category: Option<String>,

    /// Algorithm within the category, e.g. "Canny".
    #[arg(long, short, required_unless_present_any = ["list", "all"])]
    algorithm: Option<String>,

    /// Parameter override as `name=value`; repeatable.
    #[arg(long = "param", short)]
    params: Vec<String>,

    /// Run every algorithm of the category concurrently.
    #[arg(long, conflicts_with = "algorithm")]
    all: bool,

    /// Print the catalog and exit.
    #[arg(long)]
    list: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // --- 1. Argument Parsing & Setup ---
    let cli = Cli::parse();
    let dispatcher = Dispatcher::new(DispatcherConfig::from_env()).context("building the algorithm catalog")?;

    if cli.list {
        print_catalog(&dispatcher);
        return Ok(());
    }

    let (Some(input), Some(output), Some(category)) = (&cli.input, &cli.output, &cli.category) else {
        bail!("input, output and --category are required");
    };

    // --- 2. Image I/O ---
    let image = image::open(input).with_context(|| format!("reading {}", input.display()))?;
    tracing::info!(path = %input.display(), width = image.width(), height = image.height(), "loaded image");

    // --- 3. Processing ---
    if cli.all {
        run_category(dispatcher, category, image, &cli.params, output).await
    } else {
        let name = cli.algorithm.as_deref().context("--algorithm is required without --all")?;
        let entry = dispatcher.registry().lookup(category, name).map_err(|e| anyhow::anyhow!(status_for(&e)))?;
        let params = ParameterSet::parse(cli.params.iter().map(String::as_str), entry.descriptor.params)?;

        match dispatcher.process(category, name, Some(&image), &params) {
            Ok(processed) => {
                processed.image.save(output).with_context(|| format!("writing {}", output.display()))?;
                println!("{}", processed.status);
                Ok(())
            }
            Err(error) => bail!(status_for(&error)),
        }
    }
}

async fn run_category(
    dispatcher: Dispatcher,
    category: &str,
    image: DynamicImage,
    raw_params: &[String],
    output: &Path,
) -> anyhow::Result<()> {
    let names = dispatcher.registry().list_algorithms(category).map_err(|e| anyhow::anyhow!(status_for(&e)))?;
    let mut requests = Vec::with_capacity(names.len());
    for name in &names {
        let entry = dispatcher.registry().lookup(category, name)?;
        requests.push((*name, applicable_params(raw_params, entry.descriptor.params)?));
    }

    let pool = DispatchPool::new(Arc::new(dispatcher));
    let image = Arc::new(image);
    let results = join_all(
        requests
            .into_iter()
            .map(|(name, params)| pool.submit(category, name, Some(Arc::clone(&image)), params)),
    )
    .await;

    let mut failures = 0;
    for (name, result) in names.iter().zip(results) {
        match result {
            Ok(processed) => {
                let path = suffixed(output, &processed.requested.slug());
                save_png(&path, &processed.image).with_context(|| format!("writing {}", path.display()))?;
                println!("{:<24} {} -> {}", name, processed.status, path.display());
            }
            Err(error) => {
                failures += 1;
                println!("{:<24} {}", name, status_for(&error));
            }
        }
    }
    if failures == names.len() {
        bail!("every algorithm in {category} failed");
    }
    Ok(())
}

/// Parses the `name=value` pairs whose name the schema declares; the rest belong to
/// other algorithms of the category.
fn applicable_params(raw: &[String], schema: &[ParamSpec]) -> anyhow::Result<ParameterSet> {
    let pairs = raw.iter().map(String::as_str).filter(|pair| {
        let name = pair.split_once('=').map_or(*pair, |(name, _)| name).trim();
        schema.iter().any(|spec| spec.name == name)
    });
    Ok(ParameterSet::parse(pairs, schema)?)
}

fn suffixed(output: &Path, suffix: &str) -> PathBuf {
    let stem = output.file_stem().and_then(|s| s.to_str()).unwrap_or("output");
    output.with_file_name(format!("{stem}_{suffix}.png"))
}

fn print_catalog(dispatcher: &Dispatcher) {
    let registry = dispatcher.registry();
    println!("library: {}", dispatcher.library_name());
    for category in Category::ALL {
        println!("{category}");
        for descriptor in registry.descriptors(category) {
            let routed = dispatcher.route(descriptor.algorithm);
            let note = if routed == descriptor.algorithm { String::new() } else { format!(" [runs {routed}]") };
            println!("  {}{} - {}", descriptor.name(), note, descriptor.summary);
            for spec in descriptor.params {
                println!("      {} = {}  ({})", spec.name, spec.default_value(), spec.doc);
            }
        }
    }
}
