use clap::{Parser, Subcommand};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use serde_json::{json, Value};

#[derive(Parser)]
#[command(name = "guard-cli")]
#[command(about = "Management CLI for the Music Legends admission guard", long_about = None)]
struct Cli {
    #[arg(short, long, default_value = "http://localhost:8090")]
    url: String,

    #[arg(short, long, env = "GUARD_ADMIN_KEY", default_value = "CHANGE_ME_IN_PRODUCTION")]
    key: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show guard status and store mode
    Status,
    /// Run one admission check, counting against the user's quota
    Check { user_id: String, action: String },
    /// Aggregate abuse report
    Report,
    /// Show one user's abuse record
    Score { user_id: String },
    /// Reset one user's abuse score
    Reset { user_id: String },
    /// Show recent security events
    Events {
        #[arg(short, long, default_value_t = 20)]
        limit: usize,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let client = reqwest::Client::new();
    let base = cli.url.trim_end_matches('/');

    let mut headers = HeaderMap::new();
    headers.insert(
        AUTHORIZATION,
        HeaderValue::from_str(&format!("Bearer {}", cli.key))?,
    );

    let request = match cli.command {
        Commands::Status => client.get(format!("{base}/admin/status")).headers(headers),
        Commands::Check { user_id, action } => client
            .post(format!("{base}/v1/admission"))
            .json(&json!({ "user_id": user_id, "action": action })),
        Commands::Report => client.get(format!("{base}/admin/abuse/report")).headers(headers),
        Commands::Score { user_id } => client
            .get(format!("{base}/admin/abuse/{user_id}"))
            .headers(headers),
        Commands::Reset { user_id } => client
            .post(format!("{base}/admin/abuse/{user_id}/reset"))
            .headers(headers),
        Commands::Events { limit } => client
            .get(format!("{base}/admin/events"))
            .query(&[("limit", limit)])
            .headers(headers),
    };

    print_response(request.send().await?).await
}

async fn print_response(res: reqwest::Response) -> Result<(), Box<dyn std::error::Error>> {
    let status = res.status();
    // 429 carries the denial body, which is the interesting part of `check`.
    if !status.is_success() && status != reqwest::StatusCode::TOO_MANY_REQUESTS {
        eprintln!("Error: guard returned status {}", status);
        if let Ok(text) = res.text().await {
            eprintln!("Response: {}", text);
        }
        return Ok(());
    }

    let json: Value = res.json().await?;
    println!("{}", serde_json::to_string_pretty(&json)?);
    Ok(())
}
