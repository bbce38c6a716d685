pub mod client;
pub mod commands;
pub mod utils;

use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};

use crate::cli::client::MigrationClient;

pub const DEFAULT_SERVER: &str = "http://localhost:3000";

#[derive(Parser, Debug)]
#[command(name = "migrate")]
#[command(about = "Tenant migration CLI - move organizations between shared and dedicated datastores")]
#[command(version)]
pub struct Cli {
    #[arg(long, global = true, help = "Output in human-readable text format")]
    pub text: bool,

    #[arg(long, global = true, help = "Output in JSON format")]
    pub json: bool,

    #[arg(long, global = true, help = "Migrator base URL (default: $MIGRATE_SERVER or http://localhost:3000)")]
    pub server: Option<String>,

    #[arg(long, global = true, help = "Bearer token (default: $MIGRATE_TOKEN)")]
    pub token: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    #[command(about = "Start (or resume) migrating an organization")]
    Start(commands::migration::StartArgs),

    #[command(about = "Show the latest migration of an organization")]
    Status {
        #[arg(help = "Organization id")]
        org_id: String,
    },

    #[command(about = "Abort a migration that has not completed")]
    Abort {
        #[arg(help = "Organization id")]
        org_id: String,
        #[arg(help = "Migration id")]
        migration_id: String,
        #[arg(long, help = "Reason recorded on the migration")]
        reason: Option<String>,
    },

    #[command(about = "Verify the copy and cut the organization over")]
    Finalize {
        #[arg(help = "Organization id")]
        org_id: String,
        #[arg(help = "Migration id")]
        migration_id: String,
        #[arg(long, help = "Required: confirm the cutover")]
        yes: bool,
    },

    #[command(about = "Issue an operator token signed with JWT_SECRET")]
    Token(commands::token::TokenArgs),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum OutputFormat {
    Text,
    Json,
}

impl OutputFormat {
    pub fn from_cli(cli: &Cli) -> Self {
        if cli.json {
            OutputFormat::Json
        } else {
            OutputFormat::Text
        }
    }
}

impl Cli {
    pub fn server_url(&self) -> String {
        self.server
            .clone()
            .or_else(|| std::env::var("MIGRATE_SERVER").ok())
            .unwrap_or_else(|| DEFAULT_SERVER.to_string())
    }

    pub fn bearer_token(&self) -> Option<String> {
        self.token
            .clone()
            .or_else(|| std::env::var("MIGRATE_TOKEN").ok())
            .filter(|t| !t.trim().is_empty())
    }
}

pub async fn run(cli: Cli) -> anyhow::Result<()> {
    let output_format = OutputFormat::from_cli(&cli);

    if let Commands::Token(args) = &cli.command {
        return commands::token::handle(args, output_format);
    }

    let client = MigrationClient::new(&cli.server_url(), cli.bearer_token())?;

    match cli.command {
        Commands::Start(args) => commands::migration::start(&client, args, output_format).await,
        Commands::Status { org_id } => commands::migration::status(&client, &org_id, output_format).await,
        Commands::Abort {
            org_id,
            migration_id,
            reason,
        } => commands::migration::abort(&client, &org_id, &migration_id, reason, output_format).await,
        Commands::Finalize {
            org_id,
            migration_id,
            yes,
        } => commands::migration::finalize(&client, &org_id, &migration_id, yes, output_format).await,
        Commands::Token(_) => Ok(()),
    }
}
