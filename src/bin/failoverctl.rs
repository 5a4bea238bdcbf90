//! CLI for the failoverd control surface

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "failoverctl")]
#[command(about = "failoverd control surface CLI")]
#[command(version)]
struct Cli {
    /// Controller URL
    #[arg(long, default_value = "http://127.0.0.1:11000")]
    server: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the registered masters
    Get,

    /// Register masters
    Add {
        #[arg(required = true, value_delimiter = ',')]
        masters: Vec<String>,
    },

    /// Replace the registered masters
    Set {
        #[arg(value_delimiter = ',')]
        masters: Vec<String>,
    },

    /// Deregister masters
    Del {
        #[arg(required = true, value_delimiter = ',')]
        masters: Vec<String>,
    },

    /// Print controller status
    Status,
}

async fn send_masters(
    client: &reqwest::Client,
    method: reqwest::Method,
    url: &str,
    masters: &[String],
) -> anyhow::Result<()> {
    let resp = client
        .request(method.clone(), url)
        .form(&[("masters", masters.join(","))])
        .send()
        .await
        .with_context(|| format!("{} {}", method, url))?;
    if !resp.status().is_success() {
        bail!("{} {} failed: {} {}", method, url, resp.status(), resp.text().await?);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let client = reqwest::Client::new();
    let base = cli.server.trim_end_matches('/');
    let master_url = format!("{}/master", base);

    match cli.command {
        Commands::Get => {
            let body = client.get(&master_url).send().await?.text().await?;
            for master in body.split(',').filter(|m| !m.is_empty()) {
                println!("{}", master);
            }
        }

        Commands::Add { masters } => {
            send_masters(&client, reqwest::Method::POST, &master_url, &masters).await?;
            println!("added {}", masters.join(","));
        }

        Commands::Set { masters } => {
            send_masters(&client, reqwest::Method::PUT, &master_url, &masters).await?;
            println!("set {}", masters.join(","));
        }

        Commands::Del { masters } => {
            send_masters(&client, reqwest::Method::DELETE, &master_url, &masters).await?;
            println!("deleted {}", masters.join(","));
        }

        Commands::Status => {
            let status: serde_json::Value = client
                .get(format!("{}/status", base))
                .send()
                .await?
                .json()
                .await?;
            println!("Controller status:");
            println!("  Address: {}", status["addr"].as_str().unwrap_or("-"));
            println!("  Broker: {}", status["broker"].as_str().unwrap_or("-"));
            println!("  Leader: {}", status["leader"].as_str().unwrap_or("-"));
            println!("  Is leader: {}", status["is_leader"]);
            println!("  Masters: {}", status["masters"]);
        }
    }

    Ok(())
}
