use clap::{Parser, Subcommand};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use serde_json::{json, Value};

#[derive(Parser)]
#[command(name = "orchestrator-cli")]
#[command(about = "Management CLI for the MCP orchestrator", long_about = None)]
struct Cli {
    #[arg(short, long, default_value = "http://localhost:8081")]
    url: String,

    #[arg(short, long, env = "ORCHESTRATOR_API_KEY", default_value = "CHANGE_ME_IN_PRODUCTION")]
    key: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check orchestrator status
    Status,
    /// List registered servers
    Servers,
    /// Server metrics, all or one
    Metrics { id: Option<String> },
    /// Connection pool statistics
    Pools,
    /// Response cache statistics
    Cache,
    /// Stop and remove a server
    Unregister { id: String },
    /// Route a JSON-RPC call
    Call {
        method: String,
        /// JSON params
        params: Option<String>,
        /// Route to this server type
        #[arg(short = 't', long = "type")]
        server_type: Option<String>,
    },
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
        Commands::Servers => client.get(format!("{}/admin/servers", cli.url)),
        Commands::Metrics { id: Some(id) } => client.get(format!("{}/admin/servers/{}/metrics", cli.url, id)),
        Commands::Metrics { id: None } => client.get(format!("{}/admin/metrics", cli.url)),
        Commands::Pools => client.get(format!("{}/admin/pools", cli.url)),
        Commands::Cache => client.get(format!("{}/admin/cache", cli.url)),
        Commands::Unregister { id } => client.delete(format!("{}/admin/servers/{}", cli.url, id)),
        Commands::Call {
            method,
            params,
            server_type,
        } => {
            let params: Option<Value> = params.as_deref().map(serde_json::from_str).transpose()?;
            let url = match server_type {
                Some(t) => format!("{}/rpc/{}", cli.url, t),
                None => format!("{}/rpc", cli.url),
            };
            client
                .post(url)
                .json(&json!({"jsonrpc": "2.0", "id": 1, "method": method, "params": params}))
        }
    };

    let res = request.headers(headers).send().await?;
    print_response(res).await
}

async fn print_response(res: reqwest::Response) -> Result<(), Box<dyn std::error::Error>> {
    let status = res.status();
    if status == reqwest::StatusCode::NO_CONTENT {
        println!("ok");
        return Ok(());
    }
    let text = res.text().await?;
    if !status.is_success() {
        eprintln!("Error: Admin API returned status {}", status);
    }
    match serde_json::from_str::<Value>(&text) {
        Ok(json) => println!("{}", serde_json::to_string_pretty(&json)?),
        Err(_) => println!("{}", text),
    }
    if !status.is_success() {
        std::process::exit(1);
    }
    Ok(())
}
