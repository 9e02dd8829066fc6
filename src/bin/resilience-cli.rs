use clap::{ArgGroup, Parser, Subcommand};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::Method;
use serde_json::Value;

#[derive(Parser)]
#[command(name = "resilience-cli")]
#[command(about = "Management CLI for the resilience agent", long_about = None)]
struct Cli {
    /// Base URL of the agent's admin API.
    #[arg(short, long, default_value = "http://127.0.0.1:8081")]
    url: String,

    /// Admin API key.
    #[arg(short, long, env = "RESILIENCE_ADMIN_KEY", default_value = "CHANGE_ME_IN_PRODUCTION")]
    key: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Overall agent status
    Status,
    /// Availability and fallback support per service
    Services,
    /// Circuit breaker states
    Circuits,
    /// Force a circuit back to closed
    Reset {
        /// Endpoint identifier, e.g. /credit-scoring
        endpoint: String,
    },
    /// Run one stuck/stale query sweep now
    Sync,
    /// Show or change forced offline mode
    #[command(group(ArgGroup::new("mode").args(["enable", "disable"])))]
    Offline {
        #[arg(long)]
        enable: bool,
        #[arg(long)]
        disable: bool,
    },
}

impl Commands {
    /// Method, admin path and query parameters for this command.
    fn request(&self) -> (Method, &'static str, Vec<(&'static str, String)>) {
        match self {
            Commands::Status => (Method::GET, "/admin/status", Vec::new()),
            Commands::Services => (Method::GET, "/admin/services", Vec::new()),
            Commands::Circuits => (Method::GET, "/admin/circuits", Vec::new()),
            Commands::Reset { endpoint } => (
                Method::POST,
                "/admin/circuits/reset",
                vec![("endpoint", endpoint.clone())],
            ),
            Commands::Sync => (Method::POST, "/admin/sync", Vec::new()),
            Commands::Offline { enable: true, .. } => {
                (Method::POST, "/admin/offline", vec![("enabled", "true".into())])
            }
            Commands::Offline { disable: true, .. } => {
                (Method::POST, "/admin/offline", vec![("enabled", "false".into())])
            }
            Commands::Offline { .. } => (Method::GET, "/admin/offline", Vec::new()),
        }
    }
}

fn build_request(
    client: &reqwest::Client,
    base: &str,
    command: &Commands,
    headers: HeaderMap,
) -> reqwest::RequestBuilder {
    let (method, path, query) = command.request();
    let builder = client
        .request(method, format!("{}{}", base.trim_end_matches('/'), path))
        .headers(headers);
    if query.is_empty() {
        builder
    } else {
        builder.query(&query)
    }
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

    let res = build_request(&client, &cli.url, &cli.command, headers).send().await?;
    print_response(res).await
}

async fn print_response(res: reqwest::Response) -> Result<(), Box<dyn std::error::Error>> {
    let status = res.status();
    if !status.is_success() {
        eprintln!("Error: Admin API returned status {}", status);
        if let Ok(text) = res.text().await {
            if !text.is_empty() {
                eprintln!("Response: {}", text);
            }
        }
        std::process::exit(1);
    }

    let json: Value = res.json().await?;
    println!("{}", serde_json::to_string_pretty(&json)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url_for(command: Commands) -> String {
        build_request(&reqwest::Client::new(), "http://127.0.0.1:8081/", &command, HeaderMap::new())
            .build()
            .unwrap()
            .url()
            .to_string()
    }

    #[test]
    fn test_reset_endpoint_is_query_encoded() {
        let url = url_for(Commands::Reset {
            endpoint: "/search?q=a&b #1".into(),
        });
        assert_eq!(
            url,
            "http://127.0.0.1:8081/admin/circuits/reset?endpoint=%2Fsearch%3Fq%3Da%26b+%231"
        );
    }

    #[test]
    fn test_plain_commands_have_no_query() {
        assert_eq!(url_for(Commands::Status), "http://127.0.0.1:8081/admin/status");
        assert_eq!(
            url_for(Commands::Offline {
                enable: true,
                disable: false
            }),
            "http://127.0.0.1:8081/admin/offline?enabled=true"
        );
    }
}
