use clap::{Args, Parser, Subcommand};
use clap_complete::Shell;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "converge")]
#[command(author = "Alberto Cavalcante")]
#[command(version)]
#[command(about = "Declarative reconciliation of cloud resources", long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Verbosity level
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Config file (default: ~/.config/converge/config.toml)
    #[arg(long, global = true, env = "CONVERGE_CONFIG")]
    pub config: Option<PathBuf>,

    /// State file recording live resources
    #[arg(long, global = true, env = "CONVERGE_STATE")]
    pub state: Option<PathBuf>,

    /// Snapshot file of the emulated remote
    #[arg(long, global = true, env = "CONVERGE_REMOTE")]
    pub remote: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Show the operations a manifest would run
    Plan(ManifestArgs),

    /// Converge every resource in a manifest
    Apply(ApplyArgs),

    /// Show the recorded state of a resource
    Show(ResourceArgs),

    /// Re-read a resource from the remote and record it
    Refresh(ResourceArgs),

    /// Start managing a resource that already exists remotely
    Import(ResourceArgs),

    /// Delete a resource
    Delete(DeleteArgs),

    /// Compare a resource on the remote against its recorded state
    Drift(ResourceArgs),

    /// List recorded resources
    List,

    /// Describe resource types
    Schema {
        /// Resource type; lists all types when omitted
        resource_type: Option<String>,
    },

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Args)]
pub struct ManifestArgs {
    /// Manifest file (TOML, or JSON by extension)
    pub manifest: PathBuf,
}

#[derive(Args)]
pub struct ApplyArgs {
    /// Manifest file (TOML, or JSON by extension)
    pub manifest: PathBuf,

    /// Show what would change without calling the remote
    #[arg(short = 'n', long)]
    pub dry_run: bool,

    /// Number of resources reconciled in parallel
    #[arg(short, long, default_value = "4")]
    pub jobs: usize,

    /// Skip confirmation prompt
    #[arg(short, long)]
    pub yes: bool,
}

#[derive(Args)]
pub struct ResourceArgs {
    /// Resource type, e.g. spanner_instance
    pub resource_type: String,
    /// Scope (project)
    pub scope: String,
    /// Resource name
    pub name: String,
}

#[derive(Args)]
pub struct DeleteArgs {
    #[command(flatten)]
    pub resource: ResourceArgs,

    /// Skip confirmation prompt
    #[arg(short, long)]
    pub yes: bool,
}

impl ResourceArgs {
    pub fn identity(&self) -> declarative::ResourceIdentity {
        declarative::ResourceIdentity::new(&self.resource_type, &self.scope, &self.name)
    }
}
