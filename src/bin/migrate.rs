use clap::Parser;
use tenant_migrator::cli::Cli;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // JWT_SECRET for `migrate token`, MIGRATE_SERVER / MIGRATE_TOKEN for API calls
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    if let Err(e) = tenant_migrator::cli::run(cli).await {
        match std::env::var("CLI_VERBOSE").as_deref() {
            Ok("true") | Ok("1") => eprintln!("Error: {e:?}"),
            _ => eprintln!("Error: {e}"),
        }
        std::process::exit(1);
    }

    Ok(())
}
