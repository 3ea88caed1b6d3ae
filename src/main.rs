//! ip4tc - command-line front end over the kernel's legacy IPv4 tables
//!
//! Every mutating command loads the table, stages one edit, commits it with
//! a single atomic replace and records the outcome in the audit log.
//!
//! # Usage
//!
//! ```bash
//! ip4tc list                        # Show the default table
//! ip4tc -t mangle list --entries    # Entry-level dump of another table
//! ip4tc policy INPUT DROP           # Set a built-in chain policy
//! ip4tc zero                        # Zero every counter in the table
//! ip4tc new-chain LOGDROP           # Create a user-defined chain
//! ip4tc delete-chain LOGDROP        # Delete an empty, unreferenced chain
//! ip4tc flush INPUT --dry-run       # Show what a flush would change
//! ```

use clap::{Parser, Subcommand};
use ip4tc::audit::{self, EventType};
use ip4tc::config::{self, AppConfig};
use ip4tc::core::error::ErrorTranslation;
use ip4tc::{CommitOutcome, Error, Handle, SocketKernel};
use std::process::ExitCode;
use tracing::{debug, info, warn};

#[derive(Parser)]
#[command(name = "ip4tc")]
#[command(about = "Transactional editor for legacy iptables tables", long_about = None)]
struct Cli {
    /// Table to operate on (defaults to the configured table)
    #[arg(short, long, global = true)]
    table: Option<String>,

    /// Print the staged change instead of committing it
    #[arg(long, global = true)]
    dry_run: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List chains, policies and rules
    List {
        /// Dump raw entries with offsets instead of rules
        #[arg(long)]
        entries: bool,
    },
    /// Set the policy of a built-in chain
    Policy {
        chain: String,
        /// ACCEPT or DROP
        policy: String,
    },
    /// Zero rule and policy counters (of one chain, or the whole table)
    Zero { chain: Option<String> },
    /// Create a user-defined chain
    NewChain { name: String },
    /// Delete an empty user-defined chain without references
    DeleteChain { name: String },
    /// Delete every rule of a chain (or of every chain)
    Flush { chain: Option<String> },
}

impl Commands {
    fn event_type(&self) -> Option<EventType> {
        match self {
            Self::List { .. } => None,
            Self::Policy { .. } => Some(EventType::SetPolicy),
            Self::Zero { .. } => Some(EventType::ZeroCounters),
            Self::NewChain { .. } => Some(EventType::CreateChain),
            Self::DeleteChain { .. } => Some(EventType::DeleteChain),
            Self::Flush { .. } => Some(EventType::FlushChain),
        }
    }

    fn details(&self) -> serde_json::Value {
        match self {
            Self::List { entries } => serde_json::json!({ "entries": entries }),
            Self::Policy { chain, policy } => {
                serde_json::json!({ "chain": chain, "policy": policy })
            }
            Self::Zero { chain } | Self::Flush { chain } => serde_json::json!({ "chain": chain }),
            Self::NewChain { name } | Self::DeleteChain { name } => {
                serde_json::json!({ "chain": name })
            }
        }
    }
}

fn init_logging() {
    if let Some(mut log_path) = ip4tc::utils::get_state_dir() {
        log_path.push("ip4tc.log");
        if let Ok(file) = std::fs::File::create(log_path) {
            tracing_subscriber::fmt().with_writer(file).init();
            return;
        }
    }
    tracing_subscriber::fmt().with_writer(std::io::stderr).init();
}

fn main() -> ExitCode {
    let _ = ip4tc::utils::ensure_dirs();
    init_logging();
    let cli = Cli::parse();
    let config = config::load_or_init_config().unwrap_or_else(|e| {
        warn!("Could not write default config: {e}");
        AppConfig::default()
    });

    match run(&cli, &config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            print_error(&e.translate());
            ExitCode::FAILURE
        }
    }
}

fn print_error(translation: &ErrorTranslation) {
    eprintln!("Error: {}", translation.user_message);
    for suggestion in &translation.suggestions {
        eprintln!("  hint: {suggestion}");
    }
    if let Some(url) = &translation.help_url {
        eprintln!("  see: {url}");
    }
}

fn run(cli: &Cli, config: &AppConfig) -> ip4tc::Result<()> {
    let table = cli.table.as_deref().unwrap_or(&config.default_table);

    if !nix::unistd::getuid().is_root() {
        debug!("Not running as root; the kernel may refuse table access");
    }

    let kernel = SocketKernel::new()?;
    let mut handle = Handle::open(kernel, table)?;

    if let Commands::List { entries } = &cli.command {
        if *entries {
            print!("{}", handle.dump_entries()?);
        } else {
            print!("{}", handle.save_format()?);
        }
        return Ok(());
    }

    stage(&mut handle, &cli.command)?;

    if cli.dry_run {
        match handle.pending_diff()? {
            Some(diff) => print!("{diff}"),
            None => println!("No changes."),
        }
        return Ok(());
    }

    let result = handle.commit();
    if config.audit_enabled
        && let Some(event_type) = cli.command.event_type()
    {
        audit_commit(event_type, table, cli.command.details(), &result);
    }

    match result? {
        CommitOutcome::Unchanged => println!("No changes."),
        CommitOutcome::Replaced { entries } => {
            info!(table, entries, "Table replaced");
            println!("Table '{table}' updated ({entries} entries).");
        }
    }
    Ok(())
}

fn stage(handle: &mut Handle<SocketKernel>, command: &Commands) -> ip4tc::Result<()> {
    match command {
        Commands::List { .. } => Ok(()),
        Commands::Policy { chain, policy } => handle.set_policy(chain, policy, None),
        Commands::Zero { chain } => {
            let chains = match chain {
                Some(chain) => vec![chain.clone()],
                None => handle.chains()?,
            };
            for chain in &chains {
                handle.zero_entries(chain)?;
            }
            Ok(())
        }
        Commands::NewChain { name } => handle.create_chain(name),
        Commands::DeleteChain { name } => handle.delete_chain(name),
        Commands::Flush { chain } => {
            let chains = match chain {
                Some(chain) => vec![chain.clone()],
                None => handle.chains()?,
            };
            for chain in &chains {
                handle.flush_entries(chain)?;
            }
            Ok(())
        }
    }
}

fn audit_commit(
    event_type: EventType,
    table: &str,
    details: serde_json::Value,
    result: &ip4tc::Result<CommitOutcome>,
) {
    match result {
        Ok(_) => audit::log_operation(event_type, table, details, None),
        Err(Error::CommitConflict { reason, .. }) => audit::log_conflict(table, reason),
        Err(e) => audit::log_operation(event_type, table, details, Some(e.to_string())),
    }
}
