use clap::{Parser, Subcommand};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use serde_json::{json, Value};

#[derive(Parser)]
#[command(name = "guard-cli")]
#[command(about = "Management CLI for dos-guard", long_about = None)]
struct Cli {
    #[arg(short, long, default_value = "http://localhost:8080")]
    url: String,

    #[arg(short, long, env = "DOS_GUARD_ADMIN_KEY")]
    key: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check guard status
    Status,
    /// Show aggregated protection statistics
    Stats,
    /// List circuit breakers
    Breakers,
    /// Reset a circuit breaker to closed
    ResetBreaker { name: String },
    /// List active bans
    Bans,
    /// Ban an entity (e.g. "ip:203.0.113.7" or "user:alice")
    Ban {
        entity: String,
        /// Ban length in seconds; the profile default when omitted
        #[arg(short, long)]
        duration: Option<u64>,
    },
    /// Lift a ban
    Unban { entity: String },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let client = reqwest::Client::new();

    let mut headers = HeaderMap::new();
    headers.insert(
        AUTHORIZATION,
        HeaderValue::from_str(&format!("Bearer {}", cli.key))?,
    );

    let request = match cli.command {
        Commands::Status => client.get(format!("{}/admin/status", cli.url)),
        Commands::Stats => client.get(format!("{}/admin/stats", cli.url)),
        Commands::Breakers => client.get(format!("{}/admin/breakers", cli.url)),
        Commands::ResetBreaker { name } => client.post(format!("{}/admin/breakers/{}/reset", cli.url, name)),
        Commands::Bans => client.get(format!("{}/admin/bans", cli.url)),
        Commands::Ban { entity, duration } => client
            .post(format!("{}/admin/bans", cli.url))
            .json(&json!({ "entity": entity, "duration_secs": duration })),
        Commands::Unban { entity } => client.delete(format!("{}/admin/bans/{}", cli.url, entity)),
    };

    let res = request.headers(headers).send().await?;
    print_response(res).await?;
    Ok(())
}

async fn print_response(res: reqwest::Response) -> Result<(), Box<dyn std::error::Error>> {
    let status = res.status();
    if !status.is_success() {
        eprintln!("Error: Admin API returned status {}", status);
        if let Ok(text) = res.text().await {
            eprintln!("Response: {}", text);
        }
        return Ok(());
    }

    let text = res.text().await?;
    if text.is_empty() {
        println!("{}", status);
        return Ok(());
    }
    let json: Value = serde_json::from_str(&text)?;
    println!("{}", serde_json::to_string_pretty(&json)?);
    Ok(())
}
