use clap::{Args, Parser, Subcommand};
use color_eyre::eyre::{Result, WrapErr};
use echorpc::{
    BurstConfig, BurstContent, Content, DialOptions, EchoClient, EchoHandler, EchoServerTrait,
    EchoService, Message, SecurityMode, ServerConfig, StreamDriver, TcpRpcServer,
};
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tracing::{info, info_span};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "echorpc", version, about = "RPC echo service with unary and streaming calls")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the echo server
    Serve(ServeArgs),
    /// Call a running server: unary, server-streaming, then a bidirectional burst
    Client(ClientArgs),
}

#[derive(Args, Debug)]
struct ServeArgs {
    /// Port to listen on
    #[arg(long, env = "PORT", default_value_t = 8080)]
    port: u16,

    /// Interface to bind to
    #[arg(long, default_value = "0.0.0.0")]
    host: IpAddr,

    /// Service name prefixing every method path
    #[arg(long, default_value = "echo")]
    service: String,

    /// Maximum number of concurrent connections
    #[arg(long, default_value_t = 100)]
    max_connections: usize,
}

#[derive(Args, Debug)]
struct ClientArgs {
    /// Server address (host:port)
    #[arg(long)]
    server: String,

    /// Host name to present to the server instead of the dialed address
    #[arg(long)]
    server_host: Option<String>,

    /// Dial without TLS
    #[arg(long)]
    insecure: bool,

    /// Accept any server certificate
    #[arg(long, conflicts_with = "insecure")]
    skip_verify: bool,

    /// Number of messages in the bidirectional burst
    #[arg(long, default_value_t = 10)]
    stream_msg_num: usize,

    /// Text prefix for burst messages when no author is given
    #[arg(long, default_value = "hello")]
    message: String,

    /// Send structured content written by this author
    #[arg(long)]
    author: Option<String>,

    /// Body of the structured content
    #[arg(long, default_value = "Hi there")]
    body: String,

    /// Service name prefixing every method path
    #[arg(long, default_value = "echo")]
    service: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize error handling
    color_eyre::install()?;

    // Initialize logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("echorpc=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();
    match cli.command {
        Command::Serve(args) => serve(args).await,
        Command::Client(args) => client(args).await,
    }
}

async fn serve(args: ServeArgs) -> Result<()> {
    let config = ServerConfig::new(SocketAddr::new(args.host, args.port))
        .with_service(args.service)
        .with_max_connections(args.max_connections);

    info!(address = %config.bind_addr, service = %config.service, max_connections = config.max_connections, "Starting RPC echo server");

    let handler = EchoHandler::with_span(info_span!("echo", service = %config.service));
    let service = EchoService::new(config.service.clone()).with_handler(handler);
    let server = TcpRpcServer::new(config).with_service(service);
    server.run().await.wrap_err("Failed to run RPC echo server")
}

async fn client(args: ClientArgs) -> Result<()> {
    let security = if args.insecure {
        SecurityMode::Plaintext
    } else {
        SecurityMode::Tls {
            server_name_override: args.server_host.clone(),
            skip_verify: args.skip_verify,
        }
    };
    let mut options = DialOptions::default().with_security(security);
    if let Some(authority) = &args.server_host {
        options = options.with_authority(authority.clone());
    }

    let client = EchoClient::connect(&args.server, options, args.service.as_str())
        .await
        .wrap_err_with(|| format!("Failed to dial {}", args.server))?;

    let (message, content) = match &args.author {
        Some(author) => (
            Message::from(Content::new(args.body.as_str(), author.as_str())),
            BurstContent::Content {
                body: args.body.clone(),
                author: author.clone(),
            },
        ),
        None => (
            Message::from(args.message.as_str()),
            BurstContent::Text {
                prefix: args.message.clone(),
            },
        ),
    };

    let response = client
        .echo(message.clone())
        .await
        .wrap_err("Unary echo call failed")?;
    info!(index = response.index, received_at = %response.received_at, message = %response.message, "[unary-unary] response");

    let responses = client
        .repeat(message, 3)
        .await
        .wrap_err("Server-streaming repeat call failed")?;
    for response in &responses {
        info!(index = response.index, received_at = %response.received_at, message = %response.message, "[unary-stream] response");
    }

    let config = BurstConfig::default()
        .with_count(args.stream_msg_num)
        .with_content(content)
        .with_deadline(Duration::from_secs(10));
    let responses = StreamDriver::new(config)
        .with_span(info_span!("bidi-stream", server = %args.server))
        .run(&client)
        .await
        .wrap_err("Bidirectional stream failed")?;
    info!(received = responses.len(), "[bidi-stream] completed");

    Ok(())
}
