use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand, ValueEnum};
mod auth;
use fbe_unlock::hardware::{Unavailable, select_backend};
use fbe_unlock::keyring::{self, KernelKeyring};
use fbe_unlock::platform::{LogOnlyPreparer, OverwriteDiscard};
use fbe_unlock::{Config, DataLayout, Decryptor, KeyManager, decrypt};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(name = "fbe-unlock")]
#[command(
    version,
    about = "Recover and install file-based-encryption keys from a recovery environment."
)]
struct Cli {
    /// Path to the fbe-unlock.toml configuration file
    #[arg(
        long,
        global = true,
        value_name = "PATH",
        env = "FBE_CONFIG",
        default_value = "/etc/fbe-unlock.toml"
    )]
    config: PathBuf,

    /// Root of the data partition (overrides the configuration)
    #[arg(long, global = true, value_name = "PATH")]
    data_root: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, env = "FBE_LOG")]
    log: Option<String>,

    /// Log format (json, text)
    #[arg(long, global = true, env = "FBE_LOG_FORMAT")]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Debug, ValueEnum)]
enum LogFormat {
    Json,
    Text,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Prints the kind of credential a user has enrolled
    PasswordType {
        #[arg(long, default_value_t = 0)]
        user: u32,
    },

    /// Prints the raw key reference of a hex-encoded key
    #[command(arg_required_else_help = true)]
    KeyRef { key: String },

    /// Unlocks a user's storage keys with their credential
    Unlock {
        #[arg(long, default_value_t = 0)]
        user: u32,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let (mut config, found) = load_config(&cli.config)?;
    let level = cli.log.clone().unwrap_or_else(|| config.log.level.clone());
    let format = cli.log_format.clone().unwrap_or(match config.log.format.as_str() {
        "json" => LogFormat::Json,
        _ => LogFormat::Text,
    });
    init_logging(&level, &format);
    if !found {
        warn!(
            "config file not found: {}  (using defaults)",
            cli.config.display()
        );
    }
    if let Some(root) = cli.data_root {
        config.data_root = root;
    }
    let caps = config.capabilities().context("invalid key configuration")?;

    match cli.command {
        Commands::PasswordType { user } => {
            let layout = DataLayout::new(&config.data_root);
            println!("{}", decrypt::password_type(&layout, user));
        }
        Commands::KeyRef { key } => {
            let key = zeroize::Zeroizing::new(hex::decode(key.trim()).context("key is not hex")?);
            if key.is_empty() {
                bail!("key is empty");
            }
            println!("{}", keyring::raw_key_ref(&key, caps.wrapped_key_supported));
        }
        Commands::Unlock { user } => {
            let credential = auth::read_credential()?;
            info!(
                version = env!("CARGO_PKG_VERSION"),
                data_root = %config.data_root.display(),
                user,
                "fbe-unlock starting"
            );

            let backend = select_backend(vec![Box::new(Unavailable::new("keymaster"))])
                .context("selecting key backend")?;
            let keys = KeyManager::new(
                DataLayout::new(&config.data_root),
                caps,
                backend,
                kernel_keyring()?,
                Box::new(OverwriteDiscard),
            );
            let mut decryptor = Decryptor::new(
                keys,
                Box::new(Unavailable::new("weaver")),
                Box::new(Unavailable::new("gatekeeper")),
                Box::new(LogOnlyPreparer),
            );

            decryptor.decrypt_de()?;
            decryptor.decrypt_user(user, credential.as_bytes())?;
            println!("user {user} unlocked");
        }
    }

    Ok(())
}

fn load_config(path: &Path) -> Result<(Config, bool)> {
    if path.exists() {
        Ok((Config::load(path)?, true))
    } else {
        Ok((Config::default(), false))
    }
}

#[cfg(target_os = "linux")]
fn kernel_keyring() -> Result<Box<dyn KernelKeyring>> {
    Ok(Box::new(keyring::LinuxKeyring))
}

#[cfg(not(target_os = "linux"))]
fn kernel_keyring() -> Result<Box<dyn KernelKeyring>> {
    bail!("the kernel keyring is only available on Linux")
}

fn init_logging(level: &str, format: &LogFormat) {
    use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    match format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json().with_writer(std::io::stderr))
                .init();
        }
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_writer(std::io::stderr))
                .init();
        }
    }
}
