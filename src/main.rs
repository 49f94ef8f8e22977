//! CryptBridge - Transparent block-encrypting FUSE filesystem
//!
//! Usage:
//!   cryptbridge init --backing-root <dir> --mount-point <dir>  - Write a new configuration
//!   cryptbridge mount [mount_point]                             - Mount the filesystem
//!   cryptbridge unmount <mount_point>                           - Unmount the filesystem
//!   cryptbridge status                                          - Show configuration and usage

use clap::{Parser, Subcommand};
use cryptbridge::{
    config::Config,
    crypto::{generate_salt, BlockLayout, MountKey, NONCE_SIZE},
    fs::{CryptFs, Dispatcher},
    mount::MountContext,
    Error, Result,
};
use rand::RngCore;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser)]
#[command(name = "cryptbridge")]
#[command(author = "cryptbridge Contributors")]
#[command(version = "0.1.0")]
#[command(about = "Transparent block-encrypting passthrough filesystem")]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "~/.config/cryptbridge/config.json")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a new configuration with a fresh nonce base and salt
    Init {
        /// Directory holding the encrypted files
        #[arg(long)]
        backing_root: PathBuf,

        /// Where the plaintext view is mounted
        #[arg(long)]
        mount_point: PathBuf,

        /// Plaintext bytes per encrypted block
        #[arg(long, default_value_t = cryptbridge::config::DEFAULT_BLOCK_SIZE)]
        block_size: usize,

        /// Generate a random key file instead of using a passphrase
        #[arg(long)]
        generate_key: bool,

        /// Key file location (defaults to <data_dir>/mount.key)
        #[arg(long)]
        key_file: Option<PathBuf>,
    },

    /// Mount the filesystem
    Mount {
        /// Mount point directory (overrides the configuration)
        mount_point: Option<PathBuf>,

        /// Allow other users to access the mount
        #[arg(long)]
        allow_other: bool,
    },

    /// Unmount the filesystem
    Unmount {
        /// Mount point to unmount
        mount_point: PathBuf,
    },

    /// Show filesystem status
    Status,
}

fn main() {
    let cli = Cli::parse();

    // Setup logging; RUST_LOG takes precedence over --verbose
    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set up logging: {}", e);
    }

    let config_path = expand_tilde(&cli.config);

    if let Err(e) = run_command(cli.command, &config_path) {
        error!("Error: {}", e);
        std::process::exit(1);
    }
}

fn run_command(command: Commands, config_path: &Path) -> Result<()> {
    match command {
        Commands::Init {
            backing_root,
            mount_point,
            block_size,
            generate_key,
            key_file,
        } => cmd_init(
            config_path,
            backing_root,
            mount_point,
            block_size,
            generate_key,
            key_file,
        ),

        Commands::Mount {
            mount_point,
            allow_other,
        } => cmd_mount(config_path, mount_point, allow_other),

        Commands::Unmount { mount_point } => cmd_unmount(&mount_point),

        Commands::Status => cmd_status(config_path),
    }
}

fn cmd_init(
    config_path: &Path,
    backing_root: PathBuf,
    mount_point: PathBuf,
    block_size: usize,
    generate_key: bool,
    key_file: Option<PathBuf>,
) -> Result<()> {
    info!("Initializing cryptbridge...");

    if config_path.exists() {
        return Err(Error::Config(format!(
            "Configuration {:?} already exists",
            config_path
        )));
    }

    let mut config = Config::default();
    config.mount.backing_root = expand_tilde(&backing_root);
    config.mount.mount_point = expand_tilde(&mount_point);
    config.encryption.block_size = block_size;

    let mut base_nonce = vec![0u8; NONCE_SIZE];
    rand::thread_rng().fill_bytes(&mut base_nonce);
    config.encryption.base_nonce = base_nonce;
    config.encryption.salt = generate_salt().to_vec();

    config.validate()?;
    config.ensure_directories()?;

    if generate_key || key_file.is_some() {
        let path = key_file
            .map(|p| expand_tilde(&p))
            .unwrap_or_else(|| config.data_dir.join("mount.key"));
        if generate_key {
            MountKey::generate().save(&path)?;
            info!("Generated key file {:?}", path);
        }
        config.encryption.key_file = Some(path);
    }

    if let Some(parent) = config_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    config.save(config_path)?;

    info!("Configuration saved to {:?}", config_path);
    info!("Backing root: {:?}", config.mount.backing_root);
    info!("");
    info!("Next steps:");
    info!("  Run 'cryptbridge mount' to mount at {:?}", config.mount.mount_point);
    if config.encryption.key_file.is_some() {
        warn!("Keep the key file safe: without it the backing files cannot be decrypted");
    }

    Ok(())
}

/// Load the mount key from the key file, or derive it from a prompted passphrase
fn load_key(config: &Config) -> Result<MountKey> {
    match &config.encryption.key_file {
        Some(path) => MountKey::load(path),
        None => {
            let password = rpassword::prompt_password("Enter encryption password: ")
                .map_err(|e| Error::Internal(e.to_string()))?;
            MountKey::from_password(password.as_bytes(), &config.encryption)
        }
    }
}

fn cmd_mount(
    config_path: &Path,
    mount_point: Option<PathBuf>,
    allow_other: bool,
) -> Result<()> {
    let mut config = Config::load(config_path)?;
    if let Some(mount_point) = mount_point {
        config.mount.mount_point = expand_tilde(&mount_point);
    }
    config.mount.allow_other |= allow_other;
    config.validate()?;

    info!("Starting cryptbridge...");

    let key = load_key(&config)?;
    let context = MountContext::from_config(&config, key)?;
    let dispatcher = Arc::new(Dispatcher::new(context)?);
    let fs = CryptFs::new(dispatcher);

    let mount_point = &config.mount.mount_point;
    std::fs::create_dir_all(mount_point)?;

    info!("Mounting {:?} at {:?}", config.mount.backing_root, mount_point);

    let mut options = vec![
        fuser::MountOption::FSName("cryptbridge".to_string()),
        fuser::MountOption::DefaultPermissions,
    ];
    if config.mount.auto_unmount {
        options.push(fuser::MountOption::AutoUnmount);
    }
    if config.mount.allow_other {
        options.push(fuser::MountOption::AllowOther);
    }

    // The session runs in this process until the mount goes away
    info!("Use 'cryptbridge unmount {:?}' to stop", mount_point);
    fuser::mount2(fs, mount_point, &options).map_err(|e| Error::Internal(e.to_string()))?;

    info!("Unmounted {:?}", mount_point);
    Ok(())
}

fn cmd_unmount(mount_point: &Path) -> Result<()> {
    info!("Unmounting {:?}...", mount_point);

    #[cfg(target_os = "linux")]
    let output = std::process::Command::new("fusermount")
        .arg("-u")
        .arg(mount_point)
        .output()?;

    #[cfg(not(target_os = "linux"))]
    let output = std::process::Command::new("umount")
        .arg(mount_point)
        .output()?;

    if output.status.success() {
        info!("Unmounted successfully");
        Ok(())
    } else {
        Err(Error::Internal(format!(
            "Failed to unmount: {}",
            String::from_utf8_lossy(&output.stderr)
        )))
    }
}

/// Totals gathered from a walk of the backing tree
#[derive(Default)]
struct Usage {
    files: u64,
    directories: u64,
    stored_bytes: u64,
    plaintext_bytes: u64,
    torn_files: u64,
}

fn walk(dir: &Path, layout: &BlockLayout, usage: &mut Usage) -> Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            usage.directories += 1;
            walk(&entry.path(), layout, usage)?;
        } else if file_type.is_file() {
            let len = entry.metadata()?.len();
            usage.files += 1;
            usage.stored_bytes += len;
            match layout.plaintext_len(len) {
                Ok(plain) => usage.plaintext_bytes += plain,
                Err(_) => {
                    usage.torn_files += 1;
                    usage.plaintext_bytes += layout.complete_plaintext_len(len);
                }
            }
        }
    }
    Ok(())
}

fn cmd_status(config_path: &Path) -> Result<()> {
    let config = Config::load(config_path)?;
    let layout = BlockLayout::new(config.encryption.block_size)?;

    println!("cryptbridge Status");
    println!("==================");
    println!();
    println!("Configuration: {:?}", config_path);
    println!("Data directory: {:?}", config.data_dir);
    println!("Backing root: {:?}", config.mount.backing_root);
    println!("Mount point: {:?}", config.mount.mount_point);
    println!("Block size: {} bytes", config.encryption.block_size);
    println!(
        "Key source: {}",
        match &config.encryption.key_file {
            Some(path) => format!("key file {:?}", path),
            None => "passphrase (Argon2id)".to_string(),
        }
    );

    let mut usage = Usage::default();
    match walk(&config.mount.backing_root, &layout, &mut usage) {
        Ok(()) => {
            println!();
            println!("Files: {}", usage.files);
            println!("Directories: {}", usage.directories);
            println!("Stored: {} bytes", usage.stored_bytes);
            println!("Plaintext: {} bytes", usage.plaintext_bytes);
            if usage.torn_files > 0 {
                println!("Files with a torn final block: {}", usage.torn_files);
            }
        }
        Err(e) => println!("Backing root unavailable: {}", e),
    }

    Ok(())
}

/// Expand ~ to home directory
fn expand_tilde(path: &Path) -> PathBuf {
    if let Ok(rest) = path.strip_prefix("~") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    path.to_path_buf()
}
