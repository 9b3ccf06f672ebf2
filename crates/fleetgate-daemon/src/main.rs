//! fleetgate - self-hosted fleet gateway and rollout controller.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use fleetgate_core::auth::password_hash;
use fleetgate_core::db::Db;
use fleetgate_core::fs::FsHandle;
use fleetgate_core::scopes::Scopes;
use fleetgate_core::store::users::{NewUser, UserStore};
use tracing::error;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// fleetgate - device gateway and rollout controller for edge fleets
#[derive(Parser, Debug)]
#[command(name = "fleetgate")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Directory to store data
    #[arg(long)]
    data_dir: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the REST API and device-gateway services
    Serve {
        /// Operator API (and web UI) port
        #[arg(long, default_value = "8080")]
        ui_port: u16,

        /// Device gateway (mTLS) port
        #[arg(long, default_value = "8443")]
        gateway_port: u16,
    },

    /// Create a TLS certificate signing request for this server
    CreateCsr {
        /// DNS host name devices address this gateway with
        #[arg(long)]
        dnsname: String,

        /// Factory name, stored in the CSR subject
        #[arg(long)]
        factory: String,
    },

    /// Create the TLS certificate from the signing request
    SignCsr {
        /// Factory root PKI key
        #[arg(long)]
        cakey: String,

        /// Factory root PKI cert
        #[arg(long)]
        cacert: String,
    },

    /// Initialize authentication state (HMAC secret, auth config)
    AuthInit {
        /// Also seed a local auth config and an all-scopes admin user
        #[arg(long)]
        test: bool,
    },
}

fn init_logging(level: &str) -> Result<()> {
    let level = if level.is_empty() {
        std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string())
    } else {
        level.to_string()
    };
    let filter = EnvFilter::try_new(&level)
        .with_context(|| format!("invalid log level: {level}"))?;
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().json())
        .init();
    Ok(())
}

fn main() {
    let cli = Cli::parse();
    if let Err(e) = init_logging(&cli.log_level) {
        eprintln!("ERROR: {e:#}");
        std::process::exit(1);
    }

    let result = match cli.command {
        Commands::Serve {
            ui_port,
            gateway_port,
        } => run_serve(&cli.data_dir, ui_port, gateway_port),
        Commands::CreateCsr { dnsname, factory } => run_create_csr(&cli.data_dir, &dnsname, &factory),
        Commands::SignCsr { cakey, cacert } => run_sign_csr(&cli.data_dir, &cakey, &cacert),
        Commands::AuthInit { test } => run_auth_init(&cli.data_dir, test),
    };
    if let Err(e) = result {
        error!(error = format!("{e:#}"), "command failed");
        std::process::exit(1);
    }
}

fn run_serve(data_dir: &std::path::Path, ui_port: u16, gateway_port: u16) -> Result<()> {
    let runtime = tokio::runtime::Runtime::new().context("failed to start runtime")?;
    runtime.block_on(fleetgate_daemon::serve::run(data_dir, ui_port, gateway_port))
}

fn run_create_csr(data_dir: &std::path::Path, dnsname: &str, factory: &str) -> Result<()> {
    let fs = FsHandle::new(data_dir)?;
    let csr_pem = fleetgate_daemon::csr::create_csr(&fs.certs, dnsname, factory)?;
    println!("{csr_pem}");
    Ok(())
}

fn run_sign_csr(data_dir: &std::path::Path, cakey: &str, cacert: &str) -> Result<()> {
    let fs = FsHandle::new(data_dir)?;
    fleetgate_daemon::csr::sign_csr(&fs.certs, cakey, cacert)
}

/// Seeds the HMAC secret on first run; with `--test` also configures the
/// local auth provider and an all-scopes `admin` user so a fresh install
/// is immediately usable.
fn run_auth_init(data_dir: &std::path::Path, test: bool) -> Result<()> {
    let fs = FsHandle::new(data_dir)?;
    if fs.certs.hmac_secret().is_err() {
        println!("Initializing new HMAC secret");
        fs.certs.init_hmac_secret()?;
    }
    if !test {
        return Ok(());
    }

    let mut config = fs.auth.auth_config()?;
    if config.auth_type.is_empty() {
        config.auth_type = "local".to_string();
        config.new_user_default_scopes = vec!["devices:read".to_string()];
        fs.auth.save_auth_config(&config)?;
    }

    let db = Db::open(&fs.config.db_file())?;
    let users = UserStore::new(db, fs)?;
    if users.get("admin")?.is_none() {
        println!("Creating admin user with password 'admin'");
        users.create(&NewUser {
            username: "admin".to_string(),
            password: password_hash("admin")?,
            email: String::new(),
            allowed_scopes: Scopes::all(),
        })?;
    }
    Ok(())
}
