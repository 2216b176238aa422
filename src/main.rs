use clap::Parser;
use mqtt_tunnel::agent::{Agent, AgentOpts};
use mqtt_tunnel::broker::{BrokerClient, BrokerOpts};
use mqtt_tunnel::gateway::{self, GatewayOpts};
use n0_error::{Result, anyerr};
use uuid::Uuid;

/// Tunnel host assumed when none is given.
const DEFAULT_TUNNEL_HOST: &str = "tunnel.steve.fi";

#[derive(Parser)]
#[command(
    name = "mqtt-tunnel",
    version = env!("TUNNEL_VERSION"),
    about = "Expose private HTTP services to the public internet over an MQTT broker"
)]
enum Cli {
    /// Launch the client, exposing a local service to the internet.
    Client {
        /// The host:port to expose to the internet.
        #[arg(long)]
        expose: Option<String>,
        /// The address of the publicly visible tunnel host.
        #[arg(long, default_value = DEFAULT_TUNNEL_HOST)]
        tunnel: String,
        /// The name for this connection.
        #[arg(long)]
        name: Option<String>,
    },
    /// Launch the HTTP server for proxying via the broker to the clients.
    Serve {
        /// The IP to listen upon.
        #[arg(long, default_value = "127.0.0.1")]
        host: String,
        /// The port to bind upon.
        #[arg(long, default_value_t = 8080)]
        port: u16,
        /// The broker host to relay through.
        #[arg(long, default_value = "localhost")]
        broker: String,
    },
    /// Report upon our version, and exit.
    Version {
        /// Show the toolchain the binary was generated with.
        #[arg(long)]
        verbose: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    match Cli::parse() {
        Cli::Client {
            expose,
            tunnel,
            name,
        } => cmd_client(expose, tunnel, name).await,
        Cli::Serve { host, port, broker } => cmd_serve(host, port, broker).await,
        Cli::Version { verbose } => {
            show_version(verbose);
            Ok(())
        }
    }
}

async fn cmd_client(expose: Option<String>, tunnel: String, name: Option<String>) -> Result<()> {
    let Some(expose) = expose.filter(|expose| !expose.is_empty()) else {
        return Err(anyerr!("you must specify the host:port to expose"));
    };
    if tunnel.is_empty() {
        return Err(anyerr!("you must specify the address of the tunnel host"));
    }
    let agent = Agent::new(AgentOpts {
        expose,
        tunnel: tunnel.clone(),
        name,
    });
    let client_id = format!("agent-{}-{}", agent.name(), Uuid::new_v4());
    let broker = BrokerClient::connect(BrokerOpts::new(tunnel, client_id)).await?;
    tokio::select! {
        res = agent.run(&broker) => res?,
        _ = tokio::signal::ctrl_c() => {}
    }
    broker.disconnect().await;
    Ok(())
}

async fn cmd_serve(host: String, port: u16, broker_host: String) -> Result<()> {
    let client_id = format!("gateway-{}", Uuid::new_v4());
    let broker = BrokerClient::connect(BrokerOpts::new(broker_host, client_id)).await?;
    let opts = GatewayOpts {
        bind_host: host,
        bind_port: port,
    };
    tokio::select! {
        res = gateway::serve(broker.clone(), opts) => res?,
        _ = tokio::signal::ctrl_c() => {}
    }
    broker.disconnect().await;
    Ok(())
}

fn show_version(verbose: bool) {
    println!("{}", env!("TUNNEL_VERSION"));
    if verbose {
        println!("Built with {}", env!("TUNNEL_RUSTC"));
    }
}
