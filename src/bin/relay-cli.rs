use clap::{Parser, Subcommand};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::Method;
use serde_json::Value;

#[derive(Parser)]
#[command(name = "relay-cli")]
#[command(about = "Management CLI for the CORS relay", long_about = None)]
struct Cli {
    /// Base URL of the relay.
    #[arg(short, long, default_value = "http://localhost:3000")]
    url: String,

    /// Admin API key.
    #[arg(short, long, env = "RELAY_ADMIN_KEY", default_value = "")]
    key: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Liveness and readiness
    Health,
    /// Request statistics
    Metrics,
    /// Relay status (admin)
    Status,
    /// Cache statistics (admin)
    Cache,
    /// Drop every cached response (admin)
    ClearCache,
    /// Circuit breaker states
    Circuits,
    /// Reset one origin's circuit, or all of them (admin)
    ResetCircuits {
        /// Origin such as https://api.example.com
        #[arg(long)]
        origin: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let client = reqwest::Client::new();
    let base = cli.url.trim_end_matches('/');

    let mut headers = HeaderMap::new();
    if !cli.key.is_empty() {
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", cli.key))?,
        );
    }

    let (method, path) = match &cli.command {
        Commands::Health => (Method::GET, "/health/ready".to_string()),
        Commands::Metrics => (Method::GET, "/metrics".to_string()),
        Commands::Status => (Method::GET, "/admin/status".to_string()),
        Commands::Cache => (Method::GET, "/admin/cache".to_string()),
        Commands::ClearCache => (Method::POST, "/admin/cache/clear".to_string()),
        Commands::Circuits => (Method::GET, "/circuit-breakers".to_string()),
        Commands::ResetCircuits { origin } => {
            let mut url = reqwest::Url::parse(&format!("{base}/admin/circuits/reset"))?;
            if let Some(origin) = origin {
                url.query_pairs_mut().append_pair("origin", origin);
            }
            let res = client.post(url).headers(headers).send().await?;
            return print_response(res).await;
        }
    };

    let res = client
        .request(method, format!("{base}{path}"))
        .headers(headers)
        .send()
        .await?;
    print_response(res).await
}

async fn print_response(res: reqwest::Response) -> Result<(), Box<dyn std::error::Error>> {
    let status = res.status();
    if !status.is_success() {
        eprintln!("Error: relay returned status {}", status);
        if let Ok(text) = res.text().await {
            eprintln!("Response: {}", text);
        }
        return Ok(());
    }

    let json: Value = res.json().await?;
    println!("{}", serde_json::to_string_pretty(&json)?);
    Ok(())
}
