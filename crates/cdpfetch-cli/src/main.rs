use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use cdpfetch::{BrowserFetcher, FetchConfig, FetchRequest, FetchResponse, ProfileRoot};

/// cdpfetch -- perform HTTP requests through a headless Chrome.
#[derive(Parser, Debug)]
#[command(name = "cdpfetch", version, about)]
struct Cli {
    /// Path to a TOML config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Navigation timeout in seconds (overrides config)
    #[arg(long, global = true)]
    timeout: Option<u64>,

    /// Print the response as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Fetch a URL with GET
    Get {
        url: String,

        /// Request header, `Name: value` (repeatable)
        #[arg(short = 'H', long = "header")]
        headers: Vec<String>,
    },

    /// Fetch a URL with POST
    Post {
        url: String,

        /// Request header, `Name: value` (repeatable)
        #[arg(short = 'H', long = "header")]
        headers: Vec<String>,

        #[command(flatten)]
        body: BodyArgs,
    },

    /// Fetch a URL with an arbitrary method
    Request {
        /// HTTP method (PUT, DELETE, ...)
        #[arg(long, short = 'X')]
        method: String,

        url: String,

        /// Request header, `Name: value` (repeatable)
        #[arg(short = 'H', long = "header")]
        headers: Vec<String>,

        #[command(flatten)]
        body: BodyArgs,
    },
}

#[derive(Args, Debug, Default)]
struct BodyArgs {
    /// Request body
    #[arg(long, conflicts_with = "data_file")]
    data: Option<String>,

    /// Read the request body from a file
    #[arg(long)]
    data_file: Option<PathBuf>,
}

impl BodyArgs {
    fn read(&self) -> anyhow::Result<Option<Vec<u8>>> {
        if let Some(data) = &self.data {
            return Ok(Some(data.clone().into_bytes()));
        }
        match &self.data_file {
            Some(path) => {
                let bytes = std::fs::read(path)
                    .with_context(|| format!("failed to read body from {}", path.display()))?;
                Ok(Some(bytes))
            }
            None => Ok(None),
        }
    }
}

/// Split a `Name: value` header argument.
fn parse_header(raw: &str) -> anyhow::Result<(String, String)> {
    let Some((name, value)) = raw.split_once(':') else {
        bail!("invalid header `{raw}`, expected `Name: value`");
    };
    let name = name.trim();
    if name.is_empty() {
        bail!("invalid header `{raw}`, name is empty");
    }
    Ok((name.to_string(), value.trim().to_string()))
}

fn build_request(command: &Commands) -> anyhow::Result<FetchRequest> {
    let (method, url, headers, body) = match command {
        Commands::Get { url, headers } => ("GET", url, headers, None),
        Commands::Post { url, headers, body } => ("POST", url, headers, Some(body)),
        Commands::Request {
            method,
            url,
            headers,
            body,
        } => (method.as_str(), url, headers, Some(body)),
    };

    let mut request = FetchRequest::new(method, url)?;
    for raw in headers {
        let (name, value) = parse_header(raw)?;
        request = request.with_header(name, value);
    }
    if let Some(bytes) = body.map(BodyArgs::read).transpose()?.flatten() {
        request = request.with_body(bytes)?;
    }
    Ok(request)
}

fn load_config(path: Option<&Path>, timeout: Option<u64>) -> anyhow::Result<FetchConfig> {
    let mut config = FetchConfig::load(path).context("failed to load configuration")?;
    if let Some(secs) = timeout {
        config.navigation_timeout_secs = secs;
        config.validate().context("invalid --timeout")?;
    }
    Ok(config)
}

fn print_response(response: &FetchResponse, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(response)?);
        return Ok(());
    }

    match response.status {
        Some(status) => println!("{status}"),
        None => println!("(no status)"),
    }
    let mut headers: Vec<_> = response.headers.iter().collect();
    headers.sort();
    for (name, value) in headers {
        println!("{name}: {value}");
    }
    println!();
    println!("{}", response.body);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let config = load_config(cli.config.as_deref(), cli.timeout)?;
    let request = build_request(&cli.command)?;

    let profiles = ProfileRoot::from_config(config.profile_root.as_deref())
        .context("failed to create profile root")?;
    tracing::debug!(profile_root = %profiles.path().display(), "profile root ready");

    let fetcher = BrowserFetcher::new(config, Arc::new(profiles));
    let response = fetcher
        .fetch(request)
        .await
        .with_context(|| format!("fetch of {} failed", cli_url(&cli.command)))?;

    print_response(&response, cli.json)
}

fn cli_url(command: &Commands) -> &str {
    match command {
        Commands::Get { url, .. } | Commands::Post { url, .. } | Commands::Request { url, .. } => {
            url
        }
    }
}
