use clap::{ArgAction, ArgGroup, Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "heron",
    version,
    about = "Fleet TLS identities and a gated move to mutual TLS"
)]
pub struct Cli {
    /// Config file (default: <data_dir>/config.toml)
    #[arg(long, env = "HERON_CONFIG", value_name = "PATH", global = true)]
    pub config: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, env = "HERON_LOG", default_value = "info", global = true)]
    pub log_level: String,

    /// Increase verbosity (-v = debug, -vv = trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Write logs to file (in addition to stderr)
    #[arg(long, env = "HERON_LOG_FILE", value_name = "PATH", global = true)]
    pub log_file: Option<PathBuf>,

    /// Output JSON instead of human-readable text
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Create the CA, issue certificates, push them and enable dual-auth TLS
    Setup(SetupArgs),
    /// Show the last run and every certificate
    Status,
    /// Reissue and redistribute certificates (default: those due)
    Renew {
        /// Identities to renew
        identities: Vec<String>,
    },
    /// Check the certificates installed on every host
    Verify,
    /// Move the target service from password auth to enforced mTLS
    Migrate(MigrateArgs),
}

#[derive(Args, Debug)]
pub struct SetupArgs {
    /// Reissue every certificate even if the current one is valid
    #[arg(long)]
    pub force: bool,

    /// Generate only; do not copy anything to the hosts
    #[arg(long = "no-dist")]
    pub no_dist: bool,

    /// Do not touch service configuration
    #[arg(long = "no-config")]
    pub no_config: bool,
}

#[derive(Args, Debug)]
#[command(group(
    ArgGroup::new("action")
        .required(true)
        .args(["phase", "rollback", "check_certs"]),
))]
pub struct MigrateArgs {
    /// Phase to run
    #[arg(long, value_enum)]
    pub phase: Option<PhaseArg>,

    /// Undo TLS on the target service
    #[arg(long, value_enum)]
    pub rollback: Option<RollbackArg>,

    /// Only check that certificates are in place
    #[arg(long)]
    pub check_certs: bool,

    /// Confirmation phrase for disable-password (prompted when absent)
    #[arg(long, value_name = "TOKEN", requires = "phase")]
    pub confirm: Option<String>,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum PhaseArg {
    #[value(name = "redis-dual-auth")]
    RedisDualAuth,
    #[value(name = "backend-tls")]
    BackendTls,
    Verify,
    #[value(name = "disable-password")]
    DisablePassword,
    All,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum RollbackArg {
    /// Strip TLS, keep certificates
    Redis,
    /// Restore the pre-cutover config
    #[value(name = "redis-full")]
    RedisFull,
}
