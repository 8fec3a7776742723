//! zsync2: Download files by reusing what you already have
//!
//! Reads a zsync control file, finds the target's blocks in local seed
//! files, and downloads only the missing ranges over HTTP.

mod debug_log;
mod progress;

use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::builder::styling::{AnsiColor, Effects};
use clap::{Parser, Subcommand, ValueEnum, builder::Styles};
use color_eyre::Result;
use color_eyre::eyre::{WrapErr as _, bail, ensure, eyre};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc2822;
use tracing::{debug, info};

use zsync2_core::control::default_block_size;
use zsync2_core::{ControlFile, GenerateOptions, HashLengths, Syncer, Zsync2Config};
use zsync2_transport::{HttpOptions, Location, load_control, open_fetcher, resolve_url};

use crate::progress::SyncProgress;

const STYLES: Styles = Styles::styled()
    .header(AnsiColor::Green.on_default().effects(Effects::BOLD))
    .usage(AnsiColor::Green.on_default().effects(Effects::BOLD))
    .literal(AnsiColor::Cyan.on_default().effects(Effects::BOLD))
    .placeholder(AnsiColor::Cyan.on_default())
    .valid(AnsiColor::Green.on_default())
    .invalid(AnsiColor::Red.on_default());

#[derive(Parser)]
#[command(name = "zsync2")]
#[command(version)]
#[command(styles = STYLES)]
#[command(about = "Download files by reusing blocks of local copies")]
#[command(long_about = r#"
zsync2 downloads a file described by a .zsync control file, copying every
block it can find in local files and fetching only the rest with HTTP
range requests.

Examples:
  zsync2 sync https://example.com/app.AppImage.zsync     Update ./app.AppImage
  zsync2 sync app.zsync -i old/app.AppImage -o new.AppImage
  zsync2 make app.AppImage -u https://example.com/app.AppImage
  zsync2 inspect app.AppImage.zsync
"#)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Also write a detailed trace log to /tmp
    #[arg(long, global = true)]
    debug_log: bool,

    /// Config file (default: ./.zsync2.toml if present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Reconstruct the file a control file describes
    Sync {
        /// Control file URL or path
        control: String,

        /// Extra local files to reuse blocks from
        #[arg(short, long = "input")]
        inputs: Vec<PathBuf>,

        /// Output path (default: the control file's Filename)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Download URL, overriding the control file's URL header
        #[arg(short, long)]
        url: Option<String>,
    },

    /// Write a control file for a local file
    Make {
        /// File to describe
        file: PathBuf,

        /// Block size in bytes, a power of two
        #[arg(short, long)]
        block_size: Option<u64>,

        /// URL the file will be served from (default: its file name)
        #[arg(short, long)]
        url: Option<String>,

        /// Output path (default: <FILE>.zsync)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Print the header of a control file
    Inspect {
        /// Control file URL or path
        control: String,

        /// Output format
        #[arg(short, long, value_enum, default_value_t = Format::Summary)]
        format: Format,
    },

    /// Show version and build info
    Version,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Format {
    Json,
    Summary,
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = Cli::parse();

    // Setup logging
    let session = debug_log::init(cli.verbose, cli.debug_log);
    if let Some(session) = &session {
        eprintln!("Debug log: {}", session.log_path.display());
    }

    let config = match &cli.config {
        Some(path) => Zsync2Config::load_file(path)?,
        None => Zsync2Config::load(Path::new("."))?,
    };
    debug!("Config: {config:?}");

    match cli.command {
        Commands::Version => {
            eprintln!("zsync2 {}", env!("CARGO_PKG_VERSION"));
            eprintln!("Built with Rust {}", env!("CARGO_PKG_RUST_VERSION"));
            eprintln!("Control file format {}", zsync2_core::control::FORMAT_VERSION);
        }
        Commands::Sync {
            control,
            inputs,
            output,
            url,
        } => {
            sync_command(&config, &control, inputs, output, url.as_deref()).await?;
        }
        Commands::Make {
            file,
            block_size,
            url,
            output,
        } => {
            make_command(&file, block_size, url, output)?;
        }
        Commands::Inspect { control, format } => {
            inspect_command(&config, &control, format).await?;
        }
    }

    Ok(())
}

async fn sync_command(
    config: &Zsync2Config,
    control: &str,
    inputs: Vec<PathBuf>,
    output: Option<PathBuf>,
    url: Option<&str>,
) -> Result<()> {
    let progress = SyncProgress::new();
    let http = HttpOptions::from(&config.http);

    let location = Location::parse(control)?;
    progress.loading(&location.to_string());
    let control_file = load_control(&location, &http)
        .await
        .wrap_err_with(|| format!("failed to load control file {location}"))?;

    let output = match output {
        Some(path) => path,
        None => default_output(&control_file, &location)?,
    };
    let target = match url {
        Some(url) => Location::parse(url)?,
        None => resolve_url(&location, control_file.primary_url()?)?,
    };
    let seeds = seed_list(inputs, &output);
    info!(
        "Syncing {} from {target} using {} seed(s)",
        output.display(),
        seeds.len()
    );

    let name = output.display().to_string();
    let spinner = progress.sync_spinner(&name, control_file.length, control_file.block_count());
    let fetcher = open_fetcher(&target, &http, control_file.length)?;
    let syncer = Syncer::new(Arc::new(control_file), fetcher, config.sync_options());
    let result = syncer.sync_to_path(&seeds, &output).await;
    spinner.finish_and_clear();

    let report = result.wrap_err_with(|| format!("failed to sync {name}"))?;
    progress.finish(&name, &report);
    Ok(())
}

/// The output file itself goes first: it is usually the previous version.
fn seed_list(inputs: Vec<PathBuf>, output: &Path) -> Vec<PathBuf> {
    let mut seeds = Vec::with_capacity(inputs.len() + 1);
    if output.exists() {
        seeds.push(output.to_path_buf());
    }
    for input in inputs {
        if !seeds.contains(&input) {
            seeds.push(input);
        }
    }
    seeds
}

/// Output name from the control file's `Filename`, else the control file
/// name without `.zsync`. Only the final path component is used.
fn default_output(control: &ControlFile, location: &Location) -> Result<PathBuf> {
    let from_header = control
        .filename
        .as_deref()
        .and_then(|name| Path::new(name).file_name())
        .map(PathBuf::from);
    if let Some(name) = from_header {
        return Ok(name);
    }

    let name = location
        .file_name()
        .ok_or_else(|| eyre!("cannot derive an output name from {location}; use --output"))?;
    match name.strip_suffix(".zsync") {
        Some(stem) if !stem.is_empty() => Ok(PathBuf::from(stem)),
        _ => bail!("cannot derive an output name from {location}; use --output"),
    }
}

fn make_command(
    file: &Path,
    block_size: Option<u64>,
    url: Option<String>,
    output: Option<PathBuf>,
) -> Result<PathBuf> {
    let progress = SyncProgress::new();
    let meta =
        std::fs::metadata(file).wrap_err_with(|| format!("failed to stat {}", file.display()))?;
    ensure!(meta.is_file(), "{} is not a regular file", file.display());

    let block_size = block_size.unwrap_or_else(|| default_block_size(meta.len()));
    ensure!(
        block_size.is_power_of_two(),
        "block size must be a power of two, got {block_size}"
    );

    let name = file
        .file_name()
        .ok_or_else(|| eyre!("{} has no file name", file.display()))?
        .to_string_lossy()
        .into_owned();
    let options = GenerateOptions {
        block_size,
        filename: Some(name.clone()),
        mtime: meta.modified().ok().map(OffsetDateTime::from),
        url: Some(url.unwrap_or_else(|| name.clone())),
        hash_lengths: HashLengths::default(),
    };

    info!("Checksumming {} with {block_size} byte blocks", file.display());
    let reader = BufReader::new(
        File::open(file).wrap_err_with(|| format!("failed to open {}", file.display()))?,
    );
    let control = ControlFile::generate(reader, options)?;

    let output = output.unwrap_or_else(|| file.with_file_name(format!("{name}.zsync")));
    let writer = BufWriter::new(
        File::create(&output).wrap_err_with(|| format!("failed to create {}", output.display()))?,
    );
    control.write_to(writer)?;

    progress.wrote(&output.display().to_string(), control.block_count());
    Ok(output)
}

async fn inspect_command(config: &Zsync2Config, control: &str, format: Format) -> Result<()> {
    let location = Location::parse(control)?;
    let http = HttpOptions::from(&config.http);
    let control = load_control(&location, &http)
        .await
        .wrap_err_with(|| format!("failed to load control file {location}"))?;

    match format {
        Format::Json => {
            let json = serde_json::to_string_pretty(&control_summary(&control)?)?;
            println!("{json}");
        }
        Format::Summary => {
            eprintln!("Version:      {}", control.version);
            if let Some(filename) = &control.filename {
                eprintln!("Filename:     {filename}");
            }
            if let Some(mtime) = control.mtime {
                eprintln!("MTime:        {}", mtime.format(&Rfc2822)?);
            }
            eprintln!("Length:       {} bytes", control.length);
            eprintln!(
                "Blocks:       {} x {} bytes",
                control.block_count(),
                control.block_size
            );
            let lengths = control.hash_lengths;
            eprintln!(
                "Hash-Lengths: {},{},{}",
                lengths.seq_matches, lengths.rsum_bytes, lengths.checksum_bytes
            );
            for url in &control.urls {
                eprintln!("URL:          {url}");
            }
            if let Some(sha1) = &control.sha1 {
                eprintln!("SHA-1:        {sha1}");
            }
            for (name, value) in &control.extra_headers {
                eprintln!("{:<13} {value}", format!("{name}:"));
            }
        }
    }

    Ok(())
}

fn control_summary(control: &ControlFile) -> Result<serde_json::Value> {
    let mtime = control.mtime.map(|t| t.format(&Rfc2822)).transpose()?;
    let extra: serde_json::Map<String, serde_json::Value> = control
        .extra_headers
        .iter()
        .map(|(name, value)| (name.clone(), serde_json::Value::from(value.as_str())))
        .collect();

    Ok(serde_json::json!({
        "version": control.version,
        "filename": control.filename,
        "mtime": mtime,
        "length": control.length,
        "block_size": control.block_size,
        "blocks": control.block_count(),
        "hash_lengths": {
            "seq_matches": control.hash_lengths.seq_matches,
            "rsum_bytes": control.hash_lengths.rsum_bytes,
            "checksum_bytes": control.hash_lengths.checksum_bytes,
        },
        "urls": control.urls,
        "sha1": control.sha1.map(|d| d.to_hex()),
        "extra_headers": extra,
    }))
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory as _;
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_sync_args() {
        let cli = Cli::try_parse_from([
            "zsync2", "sync", "app.zsync", "-i", "a", "--input", "b", "-o", "out",
        ])
        .unwrap();
        let Commands::Sync {
            control,
            inputs,
            output,
            url,
        } = cli.command
        else {
            panic!("expected sync");
        };
        assert_eq!(control, "app.zsync");
        assert_eq!(inputs, vec![PathBuf::from("a"), PathBuf::from("b")]);
        assert_eq!(output, Some(PathBuf::from("out")));
        assert_eq!(url, None);
    }

    #[test]
    fn test_default_output_prefers_filename_header() {
        let mut control = ControlFile::generate(&b"data"[..], make_options()).unwrap();
        control.filename = Some("../../etc/app.bin".into());
        let location = Location::parse("https://example.com/x.zsync").unwrap();

        assert_eq!(
            default_output(&control, &location).unwrap(),
            PathBuf::from("app.bin")
        );
    }

    #[test]
    fn test_default_output_from_control_name() {
        let control = ControlFile::generate(&b"data"[..], make_options()).unwrap();
        let location = Location::parse("https://example.com/dl/tool.AppImage.zsync").unwrap();
        assert_eq!(
            default_output(&control, &location).unwrap(),
            PathBuf::from("tool.AppImage")
        );

        let location = Location::parse("tool.bin").unwrap();
        assert!(default_output(&control, &location).is_err());
    }

    #[test]
    fn test_seed_list_puts_existing_output_first() {
        let temp = TempDir::new().unwrap();
        let output = temp.path().join("app.bin");
        std::fs::write(&output, b"old").unwrap();

        let seeds = seed_list(vec![PathBuf::from("other"), output.clone()], &output);
        assert_eq!(seeds, vec![output, PathBuf::from("other")]);

        let missing = temp.path().join("missing");
        assert_eq!(seed_list(Vec::new(), &missing), Vec::<PathBuf>::new());
    }

    #[test]
    fn test_make_writes_parseable_control() {
        let temp = TempDir::new().unwrap();
        let file = temp.path().join("app.bin");
        let data: Vec<u8> = (0..5000u32).map(|i| (i % 253) as u8).collect();
        std::fs::write(&file, &data).unwrap();

        let output = make_command(&file, Some(1024), None, None).unwrap();
        assert_eq!(output, temp.path().join("app.bin.zsync"));

        let control = ControlFile::parse(&std::fs::read(&output).unwrap()).unwrap();
        assert_eq!(control.length, 5000);
        assert_eq!(control.block_size, 1024);
        assert_eq!(control.block_count(), 5);
        assert_eq!(control.filename.as_deref(), Some("app.bin"));
        assert_eq!(control.urls, vec!["app.bin".to_string()]);
        assert!(control.mtime.is_some());
    }

    #[test]
    fn test_make_rejects_bad_block_size() {
        let temp = TempDir::new().unwrap();
        let file = temp.path().join("app.bin");
        std::fs::write(&file, b"data").unwrap();

        assert!(make_command(&file, Some(1000), None, None).is_err());
    }

    #[test]
    fn test_control_summary_json() {
        let control = ControlFile::generate(&b"data"[..], make_options()).unwrap();
        let json = control_summary(&control).unwrap();
        assert_eq!(json["length"], 4);
        assert_eq!(json["block_size"], 2048);
        assert_eq!(json["hash_lengths"]["checksum_bytes"], 16);
    }

    fn make_options() -> GenerateOptions {
        GenerateOptions {
            block_size: 2048,
            filename: None,
            mtime: None,
            url: None,
            hash_lengths: HashLengths::default(),
        }
    }
}
