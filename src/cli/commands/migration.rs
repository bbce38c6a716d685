use clap::Args;
use serde_json::{json, Value};

use crate::cli::client::MigrationClient;
use crate::cli::utils::{output_record, output_success};
use crate::cli::OutputFormat;

#[derive(Args, Debug)]
pub struct StartArgs {
    #[arg(help = "Organization id")]
    pub org_id: String,

    #[arg(long, default_value = "dedicated", help = "Target datastore type: dedicated | shared")]
    pub to: String,

    #[arg(long, help = "Target server URI (defaults to the shared server)")]
    pub target_uri: Option<String>,

    #[arg(long, help = "Target database name")]
    pub target_db: Option<String>,

    #[arg(long, help = "Count rows without writing to the target")]
    pub dry_run: bool,

    #[arg(long, help = "Continue an earlier attempt from its checkpoints")]
    pub resume: bool,

    #[arg(long, help = "Migrate even though the organization is under legal hold")]
    pub override_legal_hold: bool,

    #[arg(long, help = "Rows per chunk (1-5000)")]
    pub chunk_size: Option<u32>,
}

impl StartArgs {
    pub fn to_body(&self) -> Value {
        let mut body = json!({
            "orgId": self.org_id,
            "targetDatastoreType": self.to,
            "dryRun": self.dry_run,
            "resume": self.resume,
            "overrideLegalHold": self.override_legal_hold,
        });
        if let Some(uri) = &self.target_uri {
            body["targetUri"] = json!(uri);
        }
        if let Some(db) = &self.target_db {
            body["targetDbName"] = json!(db);
        }
        if let Some(size) = self.chunk_size {
            body["chunkSize"] = json!(size);
        }
        body
    }
}

pub async fn start(
    client: &MigrationClient,
    args: StartArgs,
    output_format: OutputFormat,
) -> anyhow::Result<()> {
    let data = client.post("/api/migration/start", &args.to_body()).await?;
    let message = format!(
        "Migration {} for org {} is {}",
        data["migrationId"].as_str().unwrap_or("?"),
        args.org_id,
        data["status"].as_str().unwrap_or("?")
    );
    output_success(&output_format, &message, Some(data))
}

pub async fn status(
    client: &MigrationClient,
    org_id: &str,
    output_format: OutputFormat,
) -> anyhow::Result<()> {
    let data = client
        .get(&format!("/api/migration/status/{}", org_id))
        .await?;
    output_record(&output_format, &data)
}

pub async fn abort(
    client: &MigrationClient,
    org_id: &str,
    migration_id: &str,
    reason: Option<String>,
    output_format: OutputFormat,
) -> anyhow::Result<()> {
    let body = json!({ "migrationId": migration_id, "orgId": org_id, "reason": reason });
    let data = client.post("/api/migration/abort", &body).await?;
    output_record(&output_format, &data)
}

pub async fn finalize(
    client: &MigrationClient,
    org_id: &str,
    migration_id: &str,
    confirmed: bool,
    output_format: OutputFormat,
) -> anyhow::Result<()> {
    if !confirmed {
        anyhow::bail!("Refusing to cut over without --yes");
    }
    let body = json!({ "migrationId": migration_id, "orgId": org_id, "confirmCutover": true });
    let data = client.post("/api/migration/finalize", &body).await?;
    output_record(&output_format, &data)
}
