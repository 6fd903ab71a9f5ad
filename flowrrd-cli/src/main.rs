//! CLI for the flowrrd flow counter store.
//!
//! Provides commands for creating, writing, inspecting, querying, and
//! benchmarking flowrrd data files.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use clap::{Parser, Subcommand, ValueEnum};
use flowrrd::{Config, Datasource, Display, Field, MetricClass, Protocol, QueryRequest, ResultMatrix, RrdStore, Sample};
use tracing::debug;
use tracing_subscriber::EnvFilter;

/// flowrrd: round-robin storage for network flow counters.
#[derive(Parser)]
#[command(name = "flowrrd", version, about)]
struct Cli {
    /// Configuration file. Without one, defaults and `FLOWRRD_*`
    /// environment overrides apply.
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

/// Storage key arguments shared by several commands.
#[derive(clap::Args)]
struct KeyArgs {
    /// Source name; omit for the port-only aggregate.
    #[arg(long, short, default_value = "")]
    source: String,

    /// Port; 0 is the unscoped aggregate.
    #[arg(long, short, default_value_t = 0)]
    port: u16,
}

/// Available CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Create the data file for a storage key.
    Create {
        #[command(flatten)]
        key: KeyArgs,

        /// Replace an existing file.
        #[arg(long)]
        reset: bool,
    },

    /// Record one sample, e.g. `write -s gw flows=1200 bytes_tcp=40960`.
    Write {
        #[command(flatten)]
        key: KeyArgs,

        /// Sample time in seconds since the epoch (default: now).
        #[arg(long, short)]
        timestamp: Option<u64>,

        /// Counter values as FIELD=VALUE pairs.
        #[arg(required = true, value_parser = parse_field_value)]
        values: Vec<(Field, f64)>,
    },

    /// Recreate every file for the given sources (default: all configured).
    Reset {
        /// Sources to reset.
        sources: Vec<String>,
    },

    /// Query rates for graphing.
    Query {
        /// Time range ending now (e.g., "1h", "30m", "7d").
        #[arg(long, default_value = "1d", conflicts_with_all = ["start", "end"])]
        range: String,

        /// Range start in seconds since the epoch.
        #[arg(long, requires = "end")]
        start: Option<u64>,

        /// Range end in seconds since the epoch.
        #[arg(long, requires = "start")]
        end: Option<u64>,

        /// Metric class.
        #[arg(long = "type", default_value = "flows")]
        class: MetricClass,

        /// Axis that becomes the series.
        #[arg(long, default_value = "sources")]
        display: Display,

        /// Sources (default: all configured).
        #[arg(long, value_delimiter = ',')]
        sources: Vec<String>,

        /// Protocols (default: tcp,udp,icmp,other).
        #[arg(long, value_delimiter = ',')]
        protocols: Vec<Protocol>,

        /// Ports (default: all configured).
        #[arg(long, value_delimiter = ',')]
        ports: Vec<u16>,

        /// Output format.
        #[arg(long, default_value = "csv")]
        format: OutputFormat,
    },

    /// Display the layout and state of a data file.
    Info {
        #[command(flatten)]
        key: KeyArgs,
    },

    /// Print the data file path for a storage key.
    Resolve {
        #[command(flatten)]
        key: KeyArgs,
    },

    /// Run a write-path microbenchmark in a scratch directory.
    Bench {
        /// Number of samples to write per source.
        #[arg(long, default_value = "10000")]
        samples: u64,

        /// Number of sources to write.
        #[arg(long, default_value = "4")]
        sources: u32,
    },
}

/// Output format for query results.
#[derive(Clone, ValueEnum)]
enum OutputFormat {
    /// Comma-separated values.
    Csv,
    /// JSON object as returned by the query engine.
    Json,
}

fn main() {
    let cli = Cli::parse();

    if let Err(e) = run(cli) {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config(cli.config.as_ref())?;
    init_tracing(&config.log.level);

    if let Commands::Bench { samples, sources } = cli.command {
        return cmd_bench(samples, sources);
    }

    let store = RrdStore::new(Arc::new(config));
    match cli.command {
        Commands::Create { key, reset } => {
            store.create(&key.source, key.port, reset)?;
            println!("{}", store.resolve_path(&key.source, key.port).display());
            Ok(())
        }
        Commands::Write { key, timestamp, values } => cmd_write(&store, key, timestamp, values),
        Commands::Reset { sources } => {
            store.reset(&sources)?;
            println!("Reset complete");
            Ok(())
        }
        Commands::Query {
            range,
            start,
            end,
            class,
            display,
            sources,
            protocols,
            ports,
            format,
        } => {
            let (start, end) = match (start, end) {
                (Some(start), Some(end)) => (start, end),
                _ => {
                    let now = now_secs()?;
                    (now.saturating_sub(parse_duration(&range)?), now)
                }
            };
            let request = QueryRequest {
                start,
                end,
                sources,
                protocols,
                ports,
                class,
                display,
            };
            cmd_query(&store, &request, &format)
        }
        Commands::Info { key } => cmd_info(&store, &key),
        Commands::Resolve { key } => {
            println!("{}", store.resolve_path(&key.source, key.port).display());
            Ok(())
        }
        Commands::Bench { .. } => Ok(()),
    }
}

/// Loads the configuration file, or defaults plus environment overrides.
fn load_config(path: Option<&PathBuf>) -> Result<Config, Box<dyn std::error::Error>> {
    if let Some(path) = path {
        return Ok(Config::load(path)?);
    }
    let mut config = Config::default();
    config.apply_env_overrides();
    config.validate()?;
    Ok(config)
}

/// Logs to stderr. `RUST_LOG` takes precedence over the configured level.
fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Implements `flowrrd write`.
fn cmd_write(
    store: &RrdStore,
    key: KeyArgs,
    timestamp: Option<u64>,
    values: Vec<(Field, f64)>,
) -> Result<(), Box<dyn std::error::Error>> {
    let timestamp = match timestamp {
        Some(ts) => ts,
        None => now_secs()?,
    };
    let sample = Sample {
        source: key.source,
        port: key.port,
        timestamp,
        fields: values.into_iter().collect::<BTreeMap<_, _>>(),
    };
    store.write(&sample)?;
    debug!(timestamp, fields = sample.fields.len(), "sample written");
    Ok(())
}

/// Implements `flowrrd query`.
fn cmd_query(store: &RrdStore, request: &QueryRequest, format: &OutputFormat) -> Result<(), Box<dyn std::error::Error>> {
    let result = store.query(request)?;

    match format {
        OutputFormat::Csv => print_csv(&result),
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&result)?),
    }
    Ok(())
}

fn print_csv(result: &ResultMatrix) {
    println!("# start={}, end={}, step={}, rows={}", result.start, result.end, result.step, result.data.len());
    println!("timestamp,{}", result.legend.join(","));
    for (ts, values) in &result.data {
        let cells: Vec<String> = values
            .iter()
            .map(|v| v.map(|v| v.to_string()).unwrap_or_default())
            .collect();
        println!("{ts},{}", cells.join(","));
    }
}

/// Implements `flowrrd info`.
fn cmd_info(store: &RrdStore, key: &KeyArgs) -> Result<(), Box<dyn std::error::Error>> {
    let info = store.info(&key.source, key.port)?;

    println!("File: {}", info.path.display());
    println!("Size: {} ({} bytes)", format_bytes(info.size_bytes), info.size_bytes);
    println!("Step: {}", format_duration_secs(info.step));
    println!("First: {}", info.first);
    println!("Last update: {}", info.last_update);
    println!();
    println!("Fields: {}", info.fields.join(", "));
    println!();
    println!("Archives: {}", info.archives.len());
    for (i, archive) in info.archives.iter().enumerate() {
        let newest = archive
            .newest
            .map_or_else(|| "never written".to_string(), |ts| ts.to_string());
        println!(
            "  Archive {i}: cf={}, resolution={}, rows={}, span={}, newest={newest}",
            archive.cf,
            format_duration_secs(archive.resolution),
            archive.rows,
            format_duration_secs(archive.span),
        );
    }
    Ok(())
}

/// Implements `flowrrd bench`.
#[allow(clippy::cast_precision_loss)] // Benchmark stats are fine with f64 precision
fn cmd_bench(samples: u64, source_count: u32) -> Result<(), Box<dyn std::error::Error>> {
    println!("flowrrd write-path benchmark");
    println!("  Samples per source: {samples}");
    println!("  Sources: {source_count}");
    println!();

    let temp_dir = tempfile::tempdir()?;
    let mut config = Config::default();
    config.general.storage_root = temp_dir.path().to_path_buf();
    config.general.sources = (0..source_count).map(|i| format!("src-{i}")).collect();
    let store = RrdStore::new(Arc::new(config));

    let base = 1_700_000_100;
    for source in store.config().sources() {
        store.create_at(source, 0, false, base)?;
    }

    let fields: Vec<Field> = Field::all().collect();
    let start = Instant::now();

    for n in 1..=samples {
        let timestamp = base + n * 300;
        for source in store.config().sources() {
            let sample = Sample {
                source: source.clone(),
                port: 0,
                timestamp,
                fields: fields.iter().map(|&f| (f, (n % 1000) as f64 * 300.0)).collect(),
            };
            store.write(&sample)?;
        }
    }

    let elapsed = start.elapsed();
    let total_writes = samples * u64::from(source_count);
    let us_per_write = elapsed.as_micros() as f64 / total_writes.max(1) as f64;
    let writes_per_sec = total_writes as f64 / elapsed.as_secs_f64();

    println!("Results:");
    println!("  Total writes: {total_writes}");
    println!("  Elapsed: {elapsed:.3?}");
    println!("  Avg latency: {us_per_write:.1} us/write");
    println!("  Throughput: {writes_per_sec:.0} writes/sec");
    println!("  Disk usage: {}", format_bytes(flowrrd::store::storage_size(temp_dir.path())?));

    Ok(())
}

/// Parses a `FIELD=VALUE` pair.
fn parse_field_value(s: &str) -> Result<(Field, f64), String> {
    let (name, value) = s.split_once('=').ok_or_else(|| format!("expected FIELD=VALUE, got '{s}'"))?;
    let field = name.parse::<Field>().map_err(|e| e.to_string())?;
    let value = value.parse::<f64>().map_err(|e| format!("invalid value '{value}': {e}"))?;
    Ok((field, value))
}

fn now_secs() -> Result<u64, Box<dyn std::error::Error>> {
    Ok(SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs())
}

/// Parses a human-readable duration string (e.g., "1h", "30m", "7d") to seconds.
fn parse_duration(s: &str) -> Result<u64, Box<dyn std::error::Error>> {
    let s = s.trim();
    if s.is_empty() {
        return Err("Empty duration string".into());
    }

    let (num_str, unit) = s.split_at(s.len() - 1);
    let num: u64 = num_str.parse()?;

    let scale: u64 = match unit {
        "s" => 1,
        "m" => 60,
        "h" => 3600,
        "d" => 86400,
        _ => return Err(format!("Unknown duration unit: '{unit}'. Use s, m, h, or d.").into()),
    };

    num.checked_mul(scale)
        .ok_or_else(|| format!("Duration too large: '{s}'").into())
}

/// Formats seconds as a human-readable duration.
fn format_duration_secs(secs: u64) -> String {
    if secs >= 86400 && secs.is_multiple_of(86400) {
        format!("{}d", secs / 86400)
    } else if secs >= 3600 && secs.is_multiple_of(3600) {
        format!("{}h", secs / 3600)
    } else if secs >= 60 && secs.is_multiple_of(60) {
        format!("{}m", secs / 60)
    } else {
        format!("{secs}s")
    }
}

/// Formats a byte count as a human-readable string.
#[allow(clippy::cast_precision_loss)] // Byte counts are display-only
fn format_bytes(bytes: u64) -> String {
    if bytes >= 1_048_576 {
        format!("{:.1} MB", bytes as f64 / 1_048_576.0)
    } else if bytes >= 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else {
        format!("{bytes} B")
    }
}
