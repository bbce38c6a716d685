use clap::Args;
use serde_json::json;

use crate::auth::{generate_jwt, Claims};
use crate::cli::OutputFormat;
use crate::config;

#[derive(Args, Debug)]
pub struct TokenArgs {
    #[arg(help = "Operator id recorded as the actor")]
    pub subject: String,

    #[arg(long, default_value = "super_admin", help = "Role claim")]
    pub role: String,

    #[arg(long, help = "Lifetime in hours (default: JWT_EXPIRY_HOURS)")]
    pub hours: Option<u64>,
}

pub fn handle(args: &TokenArgs, output_format: OutputFormat) -> anyhow::Result<()> {
    let security = &config::config().security;
    let hours = args.hours.unwrap_or(security.jwt_expiry_hours);
    let claims = Claims::new(args.subject.clone(), Some(args.role.clone()), hours);
    let token = generate_jwt(&claims, &security.jwt_secret)?;

    match output_format {
        OutputFormat::Json => println!(
            "{}",
            serde_json::to_string_pretty(&json!({ "token": token, "expiresAt": claims.exp }))?
        ),
        OutputFormat::Text => println!("{}", token),
    }
    Ok(())
}
