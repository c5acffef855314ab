use anyhow::{Context, Result, bail};
use clap::Parser;
use router_tunnel::{
    ChunkedBody, HttpRequestSpec, HttpResponse, MultiHopPolicy, TlsOptions, TunnelOptions,
    TunnelSession, TunnelTarget, TunnelTimeouts,
    constants::{
        CONNECT_TIMEOUT_SECS, HANDSHAKE_GRACE_MS, HANDSHAKE_TIMEOUT_SECS, RESPONSE_TIMEOUT_SECS,
    },
    perform_tunneled_request,
    tls::Certificate,
};
use std::{
    fs::File,
    io::BufReader,
    path::{Path, PathBuf},
    time::Duration,
};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

/// CLI arguments for the route tunnel client
#[derive(Parser, Debug)]
#[command(name = "rtun")]
#[command(about = "Send HTTP requests through a SAP-router route tunnel", long_about = None)]
#[command(version)]
struct Args {
    /// Route descriptor, e.g. /H/saprouter.example.com/S/3299
    #[arg(short, long, env = "RTUN_ROUTE")]
    route: String,

    /// Destination host behind the router
    #[arg(long)]
    host: String,

    /// Destination port
    #[arg(short, long, default_value = "80")]
    port: u16,

    /// Speak TLS to the destination through the tunnel
    #[arg(long)]
    tls: bool,

    /// HTTP method
    #[arg(short = 'X', long, default_value = "GET")]
    method: String,

    /// Request path
    #[arg(long, default_value = "/")]
    path: String,

    /// Extra request header, "Name: value" (repeatable)
    #[arg(short = 'H', long = "header")]
    headers: Vec<String>,

    /// Request body
    #[arg(short, long)]
    data: Option<String>,

    /// Basic auth credentials, "user:password"
    #[arg(short, long, env = "RTUN_USER")]
    user: Option<String>,

    /// PEM file with additional CA certificates for --tls
    #[arg(long)]
    ca_file: Option<PathBuf>,

    /// Connection timeout toward the router in seconds
    #[arg(long, default_value_t = CONNECT_TIMEOUT_SECS)]
    connect_timeout: u64,

    /// Silence after the route request that counts as success, in milliseconds
    #[arg(long, default_value_t = HANDSHAKE_GRACE_MS)]
    grace_ms: u64,

    /// Upper bound for the route handshake in seconds
    #[arg(long, default_value_t = HANDSHAKE_TIMEOUT_SECS)]
    handshake_timeout: u64,

    /// Time allowed for each response in seconds
    #[arg(long, default_value_t = RESPONSE_TIMEOUT_SECS)]
    response_timeout: u64,

    /// Use only the first router of a multi-hop route
    #[arg(long)]
    first_hop_only: bool,

    /// Print chunked bodies with their chunk framing
    #[arg(long)]
    raw_chunked: bool,

    /// Send the request this many times over one tunnel
    #[arg(short, long, default_value = "1")]
    count: u32,

    /// Print the status line and headers before the body
    #[arg(short, long)]
    include: bool,

    /// Print each response as a JSON object
    #[arg(long)]
    json: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

/// How responses are written to stdout
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutputFormat {
    Body,
    WithHeaders,
    Json,
}

/// Configuration for one run of the client
#[derive(Debug, Clone)]
struct Config {
    route: String,
    target: TunnelTarget,
    request: HttpRequestSpec,
    options: TunnelOptions,
    count: u32,
    output: OutputFormat,
}

impl Config {
    fn from_args(args: Args) -> Result<Self> {
        let mut request = HttpRequestSpec::new(args.method.to_ascii_uppercase(), args.path);
        for header in &args.headers {
            let (name, value) = parse_header(header)?;
            request.set_header(name, value);
        }
        if let Some(credentials) = &args.user {
            let (user, password) = parse_credentials(credentials)?;
            request = request.basic_auth(user, password);
        }
        if let Some(data) = args.data {
            request = request.with_body(data);
        }

        let mut tls = TlsOptions::default();
        if let Some(path) = &args.ca_file {
            for cert in load_ca_file(path)? {
                tls = tls.with_root(cert);
            }
        }

        let options = TunnelOptions::default()
            .with_timeouts(TunnelTimeouts {
                connect: Duration::from_secs(args.connect_timeout),
                handshake_grace: Duration::from_millis(args.grace_ms),
                handshake: Duration::from_secs(args.handshake_timeout),
                response: Duration::from_secs(args.response_timeout),
            })
            .with_multi_hop(if args.first_hop_only {
                MultiHopPolicy::FirstHopOnly
            } else {
                MultiHopPolicy::Reject
            })
            .with_chunked_body(if args.raw_chunked {
                ChunkedBody::Raw
            } else {
                ChunkedBody::Decode
            })
            .with_tls(tls);

        let output = if args.json {
            OutputFormat::Json
        } else if args.include {
            OutputFormat::WithHeaders
        } else {
            OutputFormat::Body
        };

        if args.count == 0 {
            bail!("--count must be at least 1");
        }

        Ok(Self {
            route: args.route,
            target: TunnelTarget::new(args.host, args.port).with_tls(args.tls),
            request,
            options,
            count: args.count,
            output,
        })
    }
}

/// Split a "Name: value" header argument
fn parse_header(header: &str) -> Result<(String, String)> {
    let (name, value) = header
        .split_once(':')
        .with_context(|| format!("header {:?} is not in \"Name: value\" form", header))?;
    let name = name.trim();
    if name.is_empty() {
        bail!("header {:?} has an empty name", header);
    }
    Ok((name.to_string(), value.trim().to_string()))
}

fn parse_credentials(credentials: &str) -> Result<(&str, &str)> {
    credentials
        .split_once(':')
        .context("credentials must be in \"user:password\" form")
}

fn load_ca_file(path: &Path) -> Result<Vec<Certificate>> {
    let file = File::open(path).with_context(|| format!("cannot open {}", path.display()))?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("cannot parse {}", path.display()))?;
    if certs.is_empty() {
        bail!("no certificates found in {}", path.display());
    }
    debug!("Loaded {} CA certificate(s) from {}", certs.len(), path.display());
    Ok(certs)
}

fn render_json(response: &HttpResponse) -> serde_json::Value {
    serde_json::json!({
        "status": response.status_code,
        "headers": response.headers,
        "body": response.text(),
    })
}

fn print_response(response: &HttpResponse, output: OutputFormat) {
    match output {
        OutputFormat::Json => println!("{}", render_json(response)),
        OutputFormat::WithHeaders => {
            println!("HTTP {}", response.status_code);
            let mut headers: Vec<_> = response.headers.iter().collect();
            headers.sort();
            for (name, value) in headers {
                println!("{}: {}", name, value);
            }
            println!();
            println!("{}", response.text());
        }
        OutputFormat::Body => println!("{}", response.text()),
    }
}

async fn run(config: Config) -> Result<()> {
    if config.count == 1 {
        let response =
            perform_tunneled_request(&config.route, config.target, &config.request, config.options)
                .await?;
        print_response(&response, config.output);
        return Ok(());
    }

    let mut session = TunnelSession::open(&config.route, config.target, config.options).await?;
    info!("Tunnel {} open", session.tunnel_id());

    for i in 1..=config.count {
        if !session.is_open() {
            warn!("Tunnel closed by peer after {} request(s)", i - 1);
            break;
        }
        let response = session
            .request(&config.request)
            .await
            .with_context(|| format!("request {} of {} failed", i, config.count))?;
        print_response(&response, config.output);
    }

    session.close();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments
    let args = Args::parse();

    // Initialize logging
    let default_level = if args.verbose { "debug" } else { "warn" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    info!("rtun v{}", env!("CARGO_PKG_VERSION"));
    info!("Route: {}", args.route);
    info!("Destination: {}:{}", args.host, args.port);

    let config = Config::from_args(args)?;

    tokio::select! {
        result = run(config) => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl-C, closing tunnel");
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(extra: &[&str]) -> Args {
        let mut argv = vec![
            "rtun",
            "--route",
            "/H/203.0.113.9/S/3299",
            "--host",
            "10.0.0.5",
            "--port",
            "8000",
        ];
        argv.extend_from_slice(extra);
        Args::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_config_from_args_defaults() {
        let config = Config::from_args(args(&[])).unwrap();

        assert_eq!(config.route, "/H/203.0.113.9/S/3299");
        assert_eq!(config.target, TunnelTarget::new("10.0.0.5", 8000));
        assert_eq!(config.request, HttpRequestSpec::get("/"));
        assert_eq!(config.options.timeouts, TunnelTimeouts::default());
        assert_eq!(config.options.multi_hop, MultiHopPolicy::Reject);
        assert_eq!(config.options.chunked_body, ChunkedBody::Decode);
        assert_eq!(config.count, 1);
        assert_eq!(config.output, OutputFormat::Body);
    }

    #[test]
    fn test_config_from_args_full() {
        let config = Config::from_args(args(&[
            "-X",
            "post",
            "--path",
            "/sap/bc/ping",
            "-H",
            "Accept: application/json",
            "-H",
            "sap-client:100",
            "--data",
            "{}",
            "--user",
            "DEVELOPER:secret",
            "--tls",
            "--grace-ms",
            "500",
            "--response-timeout",
            "5",
            "--first-hop-only",
            "--raw-chunked",
            "--count",
            "3",
            "--json",
        ]))
        .unwrap();

        assert_eq!(config.request.method, "POST");
        assert_eq!(config.request.path, "/sap/bc/ping");
        assert_eq!(
            config.request.headers,
            vec![
                ("Accept".to_string(), "application/json".to_string()),
                ("sap-client".to_string(), "100".to_string()),
                (
                    "Authorization".to_string(),
                    "Basic REVWRUxPUEVSOnNlY3JldA==".to_string()
                ),
            ]
        );
        assert_eq!(config.request.body.as_deref(), Some(&b"{}"[..]));
        assert!(config.target.use_tls);
        assert_eq!(
            config.options.timeouts.handshake_grace,
            Duration::from_millis(500)
        );
        assert_eq!(config.options.timeouts.response, Duration::from_secs(5));
        assert_eq!(config.options.multi_hop, MultiHopPolicy::FirstHopOnly);
        assert_eq!(config.options.chunked_body, ChunkedBody::Raw);
        assert_eq!(config.count, 3);
        assert_eq!(config.output, OutputFormat::Json);
    }

    #[test]
    fn test_config_rejects_bad_input() {
        assert!(Config::from_args(args(&["-H", "no-colon"])).is_err());
        assert!(Config::from_args(args(&["-H", ": value"])).is_err());
        assert!(Config::from_args(args(&["--user", "nopassword"])).is_err());
        assert!(Config::from_args(args(&["--count", "0"])).is_err());
        assert!(Config::from_args(args(&["--ca-file", "/nonexistent/ca.pem"])).is_err());
    }

    #[test]
    fn test_parse_header() {
        assert_eq!(
            parse_header("X-Url: http://10.0.0.5:8000/").unwrap(),
            ("X-Url".to_string(), "http://10.0.0.5:8000/".to_string())
        );
    }

    #[test]
    fn test_render_json() {
        let mut response = HttpResponse::new(200);
        response
            .headers
            .insert("content-type".to_string(), "text/plain".to_string());
        response.body = "HELLO".into();

        let value = render_json(&response);
        assert_eq!(value["status"], 200);
        assert_eq!(value["headers"]["content-type"], "text/plain");
        assert_eq!(value["body"], "HELLO");
    }
}
