//! burrow: encrypted backups to S3-compatible object storage
//!
//! Commands:
//!   upload <path>                          - encrypt and upload a file or directory
//!   download <object-id> <dest> [-x]       - download, decrypt, optionally extract
//!   list                                   - list stored objects
//!
//! The first invocation with no config file walks through setup: master
//! passphrase, bucket credentials, and a generated master key + age keypair.

use std::collections::HashMap;
use std::io::Write as _;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use rand::rngs::OsRng;
use rand::RngCore;

use burrow_core::{Config, MASTER_KEY_SIZE};
use burrow_crypto::age_io::generate_keypair;
use burrow_engine::ProgressFn;
use burrow_storage::{s3_operator, OpendalStorage, S3Config, Storage};

#[derive(Parser, Debug)]
#[command(
    name = "burrow",
    version,
    about = "Encrypted backups to S3-compatible object storage",
    long_about = "burrow encrypts files or directory trees client-side and stores them \
                  in an S3-compatible bucket. Decryption parameters travel in a sealed \
                  envelope next to each object."
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Encrypt and upload a file or directory
    Upload {
        /// Local file or directory to back up
        path: PathBuf,
    },

    /// Download and decrypt an object
    Download {
        /// Object id printed by `upload`
        object_id: String,
        /// Destination path (directory or file stem)
        destination: PathBuf,
        /// Extract the tar archive into the destination directory
        #[arg(short = 'x', long)]
        extract: bool,
    },

    /// List stored objects
    List,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Upload { path } => cmd_upload(&path),
        Commands::Download {
            object_id,
            destination,
            extract,
        } => cmd_download(&object_id, &destination, extract),
        Commands::List => cmd_list(),
    }
}

// ── Commands ─────────────────────────────────────────────────────────────────

fn cmd_upload(path: &std::path::Path) -> Result<()> {
    let config = load_or_setup_config()?;
    let storage = build_storage(&config)?;

    let bars = std::sync::Arc::new(StageBars::new());
    let bars_cb = bars.clone();
    let callback = move |stage: &'static str, bytes: u64| bars_cb.update(stage, bytes);
    let progress: &ProgressFn = &callback;

    let outcome = burrow_engine::upload(&config, &storage, path, Some(progress))
        .context("upload failed")?;
    bars.finish();

    println!("✓ Uploaded {}", outcome.object_id);
    println!("  bytes:       {}", fmt_bytes(outcome.total_plain));
    println!("  compression: {}", outcome.compress.mode_used);
    if outcome.compress.final_savings >= 0.0 {
        println!(
            "  saved:       {:.1}%",
            outcome.compress.final_savings * 100.0
        );
    }
    Ok(())
}

fn cmd_download(object_id: &str, destination: &std::path::Path, extract: bool) -> Result<()> {
    let config = load_or_setup_config()?;
    let storage = build_storage(&config)?;

    let bars = std::sync::Arc::new(StageBars::new());
    let bars_cb = bars.clone();
    let callback = move |stage: &'static str, bytes: u64| bars_cb.update(stage, bytes);
    let progress: &ProgressFn = &callback;

    let result = burrow_engine::download(
        &config,
        &storage,
        object_id,
        destination,
        extract,
        Some(progress),
    )
    .context("download failed")?;
    bars.finish();

    if extract {
        println!("✓ Downloaded and extracted {} to {}", object_id, result.dest.display());
    } else {
        println!("✓ Downloaded {} to {}", object_id, result.dest.display());
    }
    Ok(())
}

fn cmd_list() -> Result<()> {
    let config = load_or_setup_config()?;
    let storage = build_storage(&config)?;

    let mut objects = storage.list("keys/").context("listing objects")?;
    objects.sort_by(|a, b| a.key.cmp(&b.key));

    if objects.is_empty() {
        println!("No objects stored.");
        return Ok(());
    }

    for object in objects {
        let object_id = object
            .key
            .trim_start_matches("keys/")
            .trim_end_matches(".envelope");
        println!("{}  {}", object_id, object.last_modified);
    }
    Ok(())
}

// ── Config loading and first-run setup ───────────────────────────────────────

fn load_or_setup_config() -> Result<Config> {
    if !Config::exists() {
        return setup();
    }
    let passphrase = rpassword::prompt_password("Master password: ")
        .context("failed to read password from terminal")?;
    Ok(Config::load(&passphrase)?)
}

fn setup() -> Result<Config> {
    println!("No config found — setting up burrow.");
    println!("Forgetting the master password means losing the data. Write it down.");
    println!();

    let passphrase =
        rpassword::prompt_password("Master password: ").context("failed to read password")?;
    let confirm =
        rpassword::prompt_password("Confirm password: ").context("failed to read password")?;
    if passphrase != confirm {
        anyhow::bail!("passwords do not match");
    }
    if passphrase.is_empty() {
        anyhow::bail!("password must not be empty");
    }

    println!();
    let key_id = prompt("Backblaze Key ID: ")?;
    let app_key =
        rpassword::prompt_password("Backblaze Application Key: ").context("failed to read key")?;
    let bucket_name = prompt("Bucket name: ")?;
    let region = prompt_with_default("Region", "us-west-002")?;

    let mut master_key = vec![0u8; MASTER_KEY_SIZE];
    OsRng.fill_bytes(&mut master_key);
    let (age_public_key, age_private_key) = generate_keypair();

    let config = Config {
        key_id,
        app_key,
        bucket_name,
        region,
        master_key,
        age_public_key,
        age_private_key,
    };
    config.validate()?;
    config.save(&passphrase)?;

    println!();
    println!("✓ Configuration saved to {}", Config::default_path()?.display());
    println!("  Public key: {}", config.age_public_key);
    Ok(config)
}

fn prompt(message: &str) -> Result<String> {
    print!("{message}");
    std::io::stdout().flush()?;
    let mut line = String::new();
    std::io::stdin().read_line(&mut line)?;
    let value = line.trim().to_owned();
    if value.is_empty() {
        anyhow::bail!("a value is required");
    }
    Ok(value)
}

fn prompt_with_default(message: &str, default: &str) -> Result<String> {
    print!("{message} [{default}]: ");
    std::io::stdout().flush()?;
    let mut line = String::new();
    std::io::stdin().read_line(&mut line)?;
    let value = line.trim();
    Ok(if value.is_empty() {
        default.to_owned()
    } else {
        value.to_owned()
    })
}

fn build_storage(config: &Config) -> Result<OpendalStorage> {
    let op = s3_operator(&S3Config::backblaze(
        &config.key_id,
        &config.app_key,
        &config.bucket_name,
        &config.region,
    ))?;
    Ok(OpendalStorage::new(op)?)
}

// ── Progress display ─────────────────────────────────────────────────────────

/// One spinner per pipeline stage, created lazily as stages report bytes.
struct StageBars {
    multi: MultiProgress,
    bars: std::sync::Mutex<HashMap<&'static str, ProgressBar>>,
}

impl StageBars {
    fn new() -> Self {
        Self {
            multi: MultiProgress::new(),
            bars: std::sync::Mutex::new(HashMap::new()),
        }
    }

    fn update(&self, stage: &'static str, bytes: u64) {
        let mut bars = self.bars.lock().expect("progress lock");
        let bar = bars.entry(stage).or_insert_with(|| {
            let pb = self.multi.add(ProgressBar::new_spinner());
            pb.set_style(
                ProgressStyle::with_template("{prefix:>10.bold} {spinner} {msg}")
                    .expect("progress template"),
            );
            pb.set_prefix(stage);
            pb.enable_steady_tick(Duration::from_millis(100));
            pb
        });
        bar.set_message(fmt_bytes(bytes));
    }

    fn finish(&self) {
        let bars = self.bars.lock().expect("progress lock");
        for bar in bars.values() {
            bar.finish();
        }
    }
}

fn fmt_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;
    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}
