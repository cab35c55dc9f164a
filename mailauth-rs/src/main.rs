//! CLI for DKIM key administration and message authentication
//!
//! # Usage
//!
//! ```bash
//! # Create, publish and activate a key
//! mailauth keygen example.com mail --algorithm ed25519-sha256
//! mailauth publish <key-id>
//! mailauth activate <key-id>
//!
//! # Replace the active key of a selector
//! mailauth rotate example.com mail
//!
//! # Sign and check messages
//! mailauth sign message.eml -o signed.eml
//! mailauth verify signed.eml --ip 192.0.2.1 --helo mx.example.com --mail-from a@example.com
//! ```

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use mailauth_rs::authentication::{AuthEngine, Envelope};
use mailauth_rs::config::Config;
use mailauth_rs::dkim::{Algorithm, SigningKey};
use mailauth_rs::utils;
use std::io::Write;
use std::net::IpAddr;
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const DEFAULT_DB: &str = "sqlite://mailauth.db?mode=rwc";

#[derive(Parser)]
#[command(name = "mailauth")]
#[command(about = "DKIM signing and SPF/DKIM/DMARC verification", long_about = None)]
struct Cli {
    /// TOML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Key database URL (e.g., sqlite://keys.db), overrides [keys] database_url
    #[arg(long, global = true)]
    db: Option<String>,

    /// Log output: pretty or json
    #[arg(long, global = true)]
    log_format: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a new key (status: generated)
    Keygen {
        domain: String,
        selector: String,
        /// rsa-sha256 or ed25519-sha256
        #[arg(short, long)]
        algorithm: Option<String>,
        /// Import an existing RSA private key instead of generating one
        #[arg(long)]
        pem: Option<PathBuf>,
    },
    /// Mark a key published and print its DNS record
    Publish { key_id: String },
    /// Start signing with a published key
    Activate { key_id: String },
    /// Replace the active key of a selector
    Rotate { domain: String, selector: String },
    /// Stop accepting signatures made with a key
    Retire { key_id: String },
    /// List keys
    List {
        #[arg(short, long)]
        domain: Option<String>,
    },
    /// Print the DNS TXT record of a key
    DnsRecord { key_id: String },
    /// DKIM-sign a message
    Sign {
        file: PathBuf,
        /// Signing domain, defaults to the From: domain
        #[arg(short, long)]
        domain: Option<String>,
        /// Write the signed message here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Run SPF, DKIM and DMARC against a message
    Verify {
        file: PathBuf,
        /// Connecting client address
        #[arg(long)]
        ip: IpAddr,
        /// HELO/EHLO name
        #[arg(long, default_value = "")]
        helo: String,
        /// Envelope sender, empty for bounces
        #[arg(long, default_value = "")]
        mail_from: String,
        /// Print the full result as JSON
        #[arg(long)]
        json: bool,
    },
}

fn init_logging(level: &str, format: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("mailauth_rs={level},mailauth={level}")));
    let registry = tracing_subscriber::registry().with(filter);

    if format.eq_ignore_ascii_case("json") {
        registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

fn print_key(key: &SigningKey) {
    let activated = key
        .activated_at
        .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| "-".to_string());
    println!(
        "{:<38} {:<24} {:<12} {:<16} {:<11} {}",
        key.id,
        key.domain,
        key.selector,
        key.algorithm.as_str(),
        key.status.as_str(),
        activated
    );
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => Config::default(),
    };
    if let Some(format) = &cli.log_format {
        config.logging.format = format.clone();
    }
    init_logging(&config.logging.level, &config.logging.format);

    config.keys.database_url = cli
        .db
        .clone()
        .or_else(|| config.keys.database_url.clone())
        .or_else(|| Some(DEFAULT_DB.to_string()));

    info!("Starting mailauth v{}", env!("CARGO_PKG_VERSION"));
    let engine = AuthEngine::from_config(config).await?;
    let keys = engine.keys();

    match cli.command {
        Commands::Keygen {
            domain,
            selector,
            algorithm,
            pem,
        } => {
            let key = match pem {
                Some(path) => {
                    let pem = std::fs::read_to_string(&path)
                        .with_context(|| format!("reading {}", path.display()))?;
                    keys.import_rsa_pem(&domain, &selector, &pem).await?
                }
                None => {
                    let name = algorithm.unwrap_or_else(|| engine.config().dkim.default_algorithm.clone());
                    let Some(algorithm) = Algorithm::parse(&name) else {
                        bail!("unsupported algorithm: {}", name);
                    };
                    keys.generate(&domain, &selector, algorithm).await?
                }
            };
            println!("✓ Key {} created for {}", key.id, key.dns_name());
        }
        Commands::Publish { key_id } => {
            let record = keys.publish(&key_id).await?;
            let key = keys
                .get(&key_id)
                .await?
                .context("key disappeared after publishing")?;
            println!("{} IN TXT \"{}\"", key.dns_name(), record);
        }
        Commands::Activate { key_id } => {
            let key = keys.activate(&key_id).await?;
            println!("✓ Key {} active for {}", key.id, key.dns_name());
        }
        Commands::Rotate { domain, selector } => {
            let rotated = keys.rotate(&domain, &selector).await?;
            println!("✓ Key {} active for {}", rotated.key.id, rotated.key.dns_name());
            println!("{} IN TXT \"{}\"", rotated.key.dns_name(), rotated.dns_record);
            for id in &rotated.demoted {
                println!("  deprecated {}", id);
            }
        }
        Commands::Retire { key_id } => {
            let key = keys.retire(&key_id).await?;
            println!("✓ Key {} retired", key.id);
        }
        Commands::List { domain } => {
            let list = keys.list(domain.as_deref()).await?;
            if list.is_empty() {
                println!("No keys found.");
            } else {
                println!(
                    "{:<38} {:<24} {:<12} {:<16} {:<11} {}",
                    "Id", "Domain", "Selector", "Algorithm", "Status", "Activated"
                );
                println!("{:-<112}", "");
                for key in &list {
                    print_key(key);
                }
                println!("\nTotal: {} key(s)", list.len());
            }
        }
        Commands::DnsRecord { key_id } => {
            println!("{}", keys.dns_record(&key_id).await?);
        }
        Commands::Sign { file, domain, output } => {
            let raw = std::fs::read(&file).with_context(|| format!("reading {}", file.display()))?;
            let Some(domain) = domain.or_else(|| utils::from_domain(&raw)) else {
                bail!("no --domain given and the message has no From: domain");
            };

            let outbound = engine.sign_outbound(&raw, &domain).await?;
            if outbound.signed_by.is_none() {
                warn!(domain = %domain, "No active key, message left unsigned");
            }

            match output {
                Some(path) => std::fs::write(&path, &outbound.bytes)
                    .with_context(|| format!("writing {}", path.display()))?,
                None => std::io::stdout().write_all(&outbound.bytes)?,
            }
        }
        Commands::Verify {
            file,
            ip,
            helo,
            mail_from,
            json,
        } => {
            let raw = std::fs::read(&file).with_context(|| format!("reading {}", file.display()))?;
            let envelope = Envelope::new(ip, helo, mail_from);
            let result = engine.verify_inbound(&raw, &envelope).await;

            if json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                println!("Authentication-Results: {}", engine.results_header(&result));
                if result.dmarc.disposition != mailauth_rs::dmarc::Policy::None {
                    println!("Disposition: {}", result.dmarc.disposition);
                }
            }
        }
    }

    Ok(())
}
