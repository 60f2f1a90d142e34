/*!
 * Capsule CLI - pack a directory into bounded zip archives and upload them
 */

use std::fs;
use std::path::{Path, PathBuf};

use capsule::{
    auth::{CredentialProvider, OAuthCredentialProvider, StaticTokenProvider},
    config::{gib_to_bytes, CapsuleConfig, LogLevel},
    core::{
        pack_and_deliver_into, ArchiveBuilder, BatchPlanner, DeliveryPipeline, EventPublisher,
        RunSummary,
    },
    error::{CapsuleError, Result, EXIT_FATAL},
    logging,
    output::{spawn_event_logger, OutputWriter},
    sink::{DriveSink, LocalDirSink, UploadSink},
};
use clap::{ArgAction, Parser, ValueEnum};
use tracing::{debug, info};

#[derive(Parser)]
#[command(name = "capsule")]
#[command(version, about = "Pack a directory into size-bounded zip archives and upload each one", long_about = None)]
struct Cli {
    /// Directory to archive
    #[arg(value_name = "DIRECTORY")]
    directory: PathBuf,

    /// Destination: Drive folder id, or a directory with --sink local
    #[arg(value_name = "FOLDER_ID")]
    destination: String,

    /// Glob pattern matched against file names, repeatable (e.g. --exclude "*.log" --exclude "*.tmp")
    #[arg(long = "exclude", value_name = "PATTERN", action = ArgAction::Append)]
    exclude_patterns: Vec<String>,

    /// Maximum uncompressed size per archive in GiB [default: 3.5]
    #[arg(long = "max-zip-gb", value_name = "GB")]
    max_zip_gb: Option<f64>,

    /// Delete source files and the archive once its upload is confirmed
    #[arg(short = 'd', long = "delete-after-sending")]
    delete_after_sending: bool,

    /// Where archives are sent
    #[arg(long, value_enum, default_value = "drive")]
    sink: SinkArg,

    /// Directory archives are staged in before upload
    #[arg(long, value_name = "DIR")]
    staging_dir: Option<PathBuf>,

    /// Deflate level 0-9
    #[arg(long, value_name = "LEVEL")]
    compression_level: Option<i64>,

    /// OAuth client secrets file
    #[arg(long, value_name = "FILE")]
    credentials: Option<PathBuf>,

    /// Where the OAuth token is cached between runs
    #[arg(long, value_name = "FILE")]
    token_cache: Option<PathBuf>,

    /// Load configuration from a TOML file
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level
    #[arg(long, value_enum)]
    log_level: Option<LogLevelArg>,

    /// Write JSON logs to a file instead of stderr
    #[arg(long, value_name = "FILE")]
    log: Option<PathBuf>,

    /// Verbose logging (debug level)
    #[arg(short = 'v', long)]
    verbose: bool,

    /// Hide upload progress bars
    #[arg(long)]
    no_progress: bool,

    /// Print the run summary as JSON
    #[arg(long)]
    json: bool,
}

#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, ValueEnum)]
enum SinkArg {
    /// Google Drive folder
    Drive,
    /// Local directory
    Local,
}

#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, ValueEnum)]
enum LogLevelArg {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<LogLevelArg> for LogLevel {
    fn from(arg: LogLevelArg) -> Self {
        match arg {
            LogLevelArg::Error => LogLevel::Error,
            LogLevelArg::Warn => LogLevel::Warn,
            LogLevelArg::Info => LogLevel::Info,
            LogLevelArg::Debug => LogLevel::Debug,
            LogLevelArg::Trace => LogLevel::Trace,
        }
    }
}

fn main() {
    let cli = Cli::parse();
    let output = OutputWriter::new(cli.json);

    let code = match run(cli, &output) {
        Ok(code) => code,
        Err(e) => {
            output.error(&format!("[{}] {}", e.category(), e));
            EXIT_FATAL
        }
    };
    std::process::exit(code);
}

fn run(cli: Cli, output: &OutputWriter) -> Result<i32> {
    let base_config = match cli.config {
        Some(ref path) => CapsuleConfig::from_file(path)?,
        None => CapsuleConfig::default(),
    };
    let config = apply_cli(base_config, &cli)?;

    if let Err(e) = logging::init_logging(&config) {
        eprintln!("Warning: Failed to initialize logging: {}", e);
    }

    let root = fs::canonicalize(&cli.directory).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => CapsuleError::NotFound(cli.directory.clone()),
        _ => CapsuleError::Io(e),
    })?;
    if !root.is_dir() {
        return Err(CapsuleError::Config(format!(
            "{} is not a directory",
            root.display()
        )));
    }

    // Credentials come first: no archive is built without a usable sink
    let sink = build_sink(cli.sink, &config)?;
    info!(
        "Packing {} into archives of at most {} bytes for {} '{}'",
        root.display(),
        config.pack.bound_bytes,
        sink.name(),
        cli.destination
    );

    let (publisher, subscriber) = EventPublisher::unbounded();
    let logger = spawn_event_logger(subscriber);

    let mut summary = RunSummary::default();
    let result = {
        let planner = BatchPlanner::new(&config.pack, ArchiveBuilder::run_prefix(&root))
            .with_publisher(publisher.clone());
        let pipeline = DeliveryPipeline::new(sink, cli.destination.clone(), config.pack.delete_after_send)
            .with_publisher(publisher);
        pack_and_deliver_into(&root, &planner, &pipeline, &mut summary)
    };
    if logger.join().is_err() {
        eprintln!("Warning: event logger thread panicked");
    }

    if let Err(e) = result {
        // report the batches that were already delivered before the abort
        if summary.uploads_succeeded + summary.uploads_failed > 0 {
            output.run_summary(&summary);
        }
        return Err(e);
    }
    output.run_summary(&summary);
    Ok(summary.exit_code())
}

/// Layer command-line flags over the file configuration
fn apply_cli(mut config: CapsuleConfig, cli: &Cli) -> Result<CapsuleConfig> {
    if let Some(level) = cli.log_level {
        config.log_level = level.into();
    }
    if cli.log.is_some() {
        config.log_file = cli.log.clone();
    }
    config.verbose |= cli.verbose;
    config.show_progress &= !cli.no_progress && !cli.json;

    if let Some(gb) = cli.max_zip_gb {
        config.pack.bound_bytes = gib_to_bytes(gb)?;
    }
    let delete = config.pack.delete_after_send || cli.delete_after_sending;
    let patterns: Vec<String> = config
        .pack
        .exclusion_patterns
        .iter()
        .chain(cli.exclude_patterns.iter())
        .cloned()
        .collect();
    config.pack = config
        .pack
        .with_exclusions(patterns)
        .with_delete_after_send(delete);
    if let Some(ref dir) = cli.staging_dir {
        config.pack.staging_dir = Some(dir.clone());
    }
    if cli.compression_level.is_some() {
        config.pack.compression_level = cli.compression_level;
    }
    if let Some(ref path) = cli.credentials {
        config.credentials_path = path.clone();
    }
    if let Some(ref path) = cli.token_cache {
        config.token_cache_path = path.clone();
    }

    config.pack.validate()?;
    Ok(config)
}

fn build_sink(kind: SinkArg, config: &CapsuleConfig) -> Result<Box<dyn UploadSink>> {
    match kind {
        SinkArg::Local => Ok(Box::new(LocalDirSink::new(Path::new(".")))),
        SinkArg::Drive => {
            let credentials: Box<dyn CredentialProvider> = match StaticTokenProvider::from_env() {
                Some(provider) => {
                    debug!("Using access token from the environment");
                    Box::new(provider)
                }
                None => Box::new(OAuthCredentialProvider::new(
                    &config.credentials_path,
                    &config.token_cache_path,
                )),
            };
            credentials.access_token()?;

            let sink = DriveSink::new(credentials)?.with_progress(config.show_progress);
            Ok(Box::new(sink))
        }
    }
}
