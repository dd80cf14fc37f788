use std::io;
use std::net::{IpAddr, Ipv4Addr};
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{error, info, Level};
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::EnvFilter;

use duplex_chat::{
    Client, ClientConfig, Console, PrintStyle, Printer, Server, ServerConfig, ShutdownPolicy,
    DEFAULT_PORT,
};

#[derive(Debug, Parser)]
#[command(
    name = "duplex-chat",
    version,
    author = "Andrew Lyjak <andrew.lyjak@gmail.com>",
    about = "Chat over raw TCP: one server, many clients, both directions at once."
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Accept clients and chat with each of them.
    Serve {
        /// Interface to listen on.
        #[arg(long, default_value_t = IpAddr::V4(Ipv4Addr::UNSPECIFIED))]
        host: IpAddr,
        #[arg(short, long, default_value_t = DEFAULT_PORT)]
        port: u16,
        /// Cancel open sessions on Ctrl-C instead of letting them finish.
        #[arg(long)]
        close_sessions_on_shutdown: bool,
    },
    /// Connect to a server and chat with it.
    Connect {
        #[arg(short, long, default_value_t = IpAddr::V4(Ipv4Addr::LOCALHOST))]
        address: IpAddr,
        #[arg(short, long, default_value_t = DEFAULT_PORT)]
        port: u16,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging();

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            error!("failed to start runtime: {}", err);
            return ExitCode::FAILURE;
        }
    };

    let code = runtime.block_on(async move {
        match cli.command {
            Command::Serve {
                host,
                port,
                close_sessions_on_shutdown,
            } => {
                let shutdown = if close_sessions_on_shutdown {
                    ShutdownPolicy::CloseSessions
                } else {
                    ShutdownPolicy::Detach
                };
                serve(ServerConfig {
                    host,
                    port,
                    shutdown,
                })
                .await
            }
            Command::Connect { address, port } => connect(ClientConfig { address, port }).await,
        }
    });

    // A stdin read may still be parked on a blocking thread; don't wait for it.
    runtime.shutdown_background();
    code
}

/// Warnings and errors go to stderr, everything else to stdout.
fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr.with_max_level(Level::WARN).or_else(io::stdout))
        .with_target(false)
        .init();
}

async fn serve(config: ServerConfig) -> ExitCode {
    let server = match Server::bind(&config).await {
        Ok(server) => server,
        Err(err) => {
            error!("{}", err);
            return ExitCode::FAILURE;
        }
    };
    let registry = server.registry();
    let shutdown = server.shutdown_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            shutdown.shutdown();
        }
    });

    server
        .run(Console::new(), Arc::new(Printer::new(PrintStyle::Tagged)))
        .await;

    if !registry.is_empty() {
        info!("Waiting for open sessions to finish; Ctrl-C again to exit now.");
        tokio::select! {
            _ = registry.wait_idle() => {}
            _ = tokio::signal::ctrl_c() => {}
        }
    }
    ExitCode::SUCCESS
}

async fn connect(config: ClientConfig) -> ExitCode {
    let mut client = match Client::connect(&config).await {
        Ok(client) => client,
        Err(err) => {
            error!("{}", err);
            return ExitCode::FAILURE;
        }
    };
    let outcome = client
        .communicate(Console::new(), &Printer::new(PrintStyle::Bare))
        .await;
    client.close().await;
    match outcome {
        Ok(reason) => {
            info!("Session ended: {}", reason);
            ExitCode::SUCCESS
        }
        Err(err) => {
            error!("{}", err);
            ExitCode::FAILURE
        }
    }
}
