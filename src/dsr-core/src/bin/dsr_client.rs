//! dsr-client - Device registration and attestation against GMS.
//!
//! Runs the device binding protocol from a desktop with the software
//! keystore and a fixed integrity attestor. Useful against test servers that
//! do not check hardware attestation.

use std::process::ExitCode;
use std::sync::Arc;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use clap::{Parser, Subcommand, ValueEnum};
use dsr_core::{
    DeviceBindingConfig, DeviceBindingEngine, DeviceBindingError, EnrollmentOutcome, FixedIntegrityAttestor,
    StaticDeviceAttributes,
};
use dsr_crypto::{NonceTag, RootNonce};
use dsr_keystore::{KeystoreCapability, SoftwareKeystore};
use tracing_subscriber::EnvFilter;

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// dsr-client - gematik DSR device binding client.
#[derive(Parser)]
#[command(name = "dsr-client")]
#[command(version = VERSION)]
#[command(about = "Device registration and attestation for the gematik DSR proof of concept")]
struct Cli {
    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Output format
    #[arg(short, long, value_enum, default_value_t = OutputFormat::Text)]
    format: OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    /// Human readable
    Text,
    /// JSON on stdout
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Show build and configuration information
    Info,

    /// Derive a purpose nonce from a root nonce
    DeriveNonce {
        /// Root nonce, base64url
        #[arg(long)]
        root: String,

        /// Tag (KEYPAIR_MTLS, CSR_MTLS, INTEGRITY, SMARTCARD, ATTEST, 1, 2)
        #[arg(long)]
        tag: String,
    },

    /// Register (if needed) and attest, then print the device token
    Enroll {
        /// Use one base URL for GMS, GMS mTLS and FD
        #[arg(long)]
        base_url: Option<String>,

        /// PEM file with pinned trust anchors
        #[arg(long)]
        pinned_chain: Option<String>,

        /// Prefix of the fixed integrity tokens
        #[arg(long, default_value = "integrity")]
        integrity_token: String,

        /// User for the device list
        #[arg(long)]
        user: Option<String>,

        /// List registered devices afterwards
        #[arg(long)]
        devices: bool,

        /// Fetch prescriptions with the device token
        #[arg(long)]
        prescriptions: bool,
    },
}

fn init_tracing(verbose: bool, json: bool) {
    let default = if json {
        "error"
    } else if verbose {
        "debug"
    } else {
        "warn"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn parse_tag(tag: &str) -> Option<NonceTag> {
    NonceTag::REGISTRATION
        .into_iter()
        .chain(NonceTag::ATTESTATION)
        .find(|candidate| candidate.as_bytes() == tag.as_bytes())
}

fn show_info(json: bool) {
    let config = DeviceBindingConfig::default();
    if json {
        let output = serde_json::json!({
            "version": VERSION,
            "target": env!("TARGET"),
            "gms_url": config.gms_url,
            "gms_mtls_url": config.gms_mtls_url,
            "fd_url": config.fd_url,
            "polling_interval_ms": config.polling.interval.as_millis() as u64,
            "polling_deadline_ms": config.polling.deadline.as_millis() as u64,
            "client_version": config.client_version,
        });
        println!("{output:#}");
        return;
    }

    println!("\nDSR CLIENT");
    println!("==========\n");
    println!("  Version:        {VERSION}");
    println!("  Target:         {}", env!("TARGET"));
    println!("  Client version: {}", config.client_version);
    println!("  Package:        {}", config.package_name);
    println!();
    println!("Services:");
    println!("  GMS:      {}", config.gms_url);
    println!("  GMS mTLS: {}", config.gms_mtls_url);
    println!("  FD:       {}", config.fd_url);
    println!();
    println!("Polling:");
    println!("  Interval: {} ms", config.polling.interval.as_millis());
    println!("  Deadline: {} ms", config.polling.deadline.as_millis());
    println!();
    println!("Keystore: software (no hardware binding)");
}

fn derive_nonce(root: &str, tag: &str, json: bool) -> Result<(), DeviceBindingError> {
    let tag = parse_tag(tag).ok_or_else(|| DeviceBindingError::config(format!("unknown tag {tag}")))?;
    let root = URL_SAFE_NO_PAD
        .decode(root.trim().trim_end_matches('='))
        .map_err(|e| DeviceBindingError::config(format!("root is not base64url: {e}")))?;
    let derived = RootNonce::new(root).derive(tag);

    if json {
        let output = serde_json::json!({
            "tag": String::from_utf8_lossy(tag.as_bytes()),
            "hex": hex::encode(derived.as_bytes()),
            "base64url": URL_SAFE_NO_PAD.encode(derived.as_bytes()),
        });
        println!("{output:#}");
    } else {
        println!("{}", hex::encode(derived.as_bytes()));
    }
    Ok(())
}

struct EnrollArgs {
    base_url: Option<String>,
    pinned_chain: Option<String>,
    integrity_token: String,
    user: Option<String>,
    devices: bool,
    prescriptions: bool,
}

async fn enroll(args: EnrollArgs, json: bool) -> Result<(), DeviceBindingError> {
    let mut config = DeviceBindingConfig::default();
    if let Some(url) = &args.base_url {
        config = config.with_base_url(url);
    }
    if let Some(path) = &args.pinned_chain {
        let pem = std::fs::read_to_string(path)
            .map_err(|e| DeviceBindingError::config(format!("cannot read {path}: {e}")))?;
        config.pinned_chain_pem = Some(pem);
    }

    let keystore: Arc<dyn KeystoreCapability> = Arc::new(SoftwareKeystore::new()?);
    let engine = DeviceBindingEngine::new(
        config,
        keystore,
        Arc::new(FixedIntegrityAttestor::new(args.integrity_token)),
        Arc::new(StaticDeviceAttributes::default()),
    )?;

    let outcome = engine.enroll().await?;
    let devices = if args.devices {
        Some(engine.list_devices(args.user.as_deref()).await?)
    } else {
        None
    };
    let prescriptions = if args.prescriptions {
        Some(engine.prescriptions(&outcome.attestation.device_token).await?)
    } else {
        None
    };

    if json {
        let output = serde_json::json!({
            "registered": outcome.registration.is_some(),
            "device_token": outcome.attestation.device_token.as_str(),
            "devices": devices,
            "prescriptions": prescriptions,
        });
        println!("{output:#}");
    } else {
        print_enrollment(&outcome);
        if let Some(devices) = devices {
            println!("\nDevices:");
            for device in devices {
                println!("  {} ({}, {})", device.device_identifier, device.device_type, device.created_at);
            }
        }
        if let Some(prescriptions) = prescriptions {
            println!("\nPrescriptions:");
            for p in prescriptions {
                println!(
                    "  {} {} {} ({})",
                    p.issued_at, p.prescription.medication, p.prescription.strength, p.doctor.name
                );
            }
        }
    }
    Ok(())
}

fn print_enrollment(outcome: &EnrollmentOutcome) {
    println!("\nENROLLMENT");
    println!("==========\n");
    match &outcome.registration {
        Some(registration) => {
            println!("  \x1b[32m[PASS]\x1b[0m Registered");
            println!("         nonce:           {}", registration.nonce);
            println!("         integrity nonce: {}", registration.integrity_nonce);
            println!("         certificate:     {} bytes", registration.client_certificate.len());
        },
        None => println!("  \x1b[33m[SKIP]\x1b[0m Already registered"),
    }
    println!("  \x1b[32m[PASS]\x1b[0m Attested");
    println!("         device token: {}", outcome.attestation.device_token.as_str());
}

fn report(err: &DeviceBindingError, json: bool) {
    if json {
        let output = serde_json::json!({
            "status": "error",
            "message": err.to_string(),
            "code": err.code(),
        });
        println!("{output}");
    } else {
        eprintln!("\x1b[31m[FAIL]\x1b[0m {err}");
        if err.is_token_not_ready() {
            eprintln!("       The server has not decided yet; try again later.");
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let json = cli.format == OutputFormat::Json;
    init_tracing(cli.verbose, json);

    let result = match cli.command {
        Commands::Info => {
            show_info(json);
            Ok(())
        },
        Commands::DeriveNonce { root, tag } => derive_nonce(&root, &tag, json),
        Commands::Enroll {
            base_url,
            pinned_chain,
            integrity_token,
            user,
            devices,
            prescriptions,
        } => {
            let args = EnrollArgs {
                base_url,
                pinned_chain,
                integrity_token,
                user,
                devices,
                prescriptions,
            };
            enroll(args, json).await
        },
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            report(&err, json);
            ExitCode::FAILURE
        },
    }
}
