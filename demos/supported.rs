// ABOUTME: Demo application printing the options a server advertises as supported
// ABOUTME: Shows the open/execute/close flow with the round_trip convenience sink

use argh::FromArgs;
use cql_transport::{Connection, ConnectionConfig, LogInstrumentation, Opcode, RequestToken};
use std::error::Error;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

/// Connect to a node and list the protocol options it supports
#[derive(FromArgs)]
struct CliArgs {
    /// whether or not to enable debugging
    #[argh(switch, short = 'd')]
    debugging: bool,

    /// the address of the node (default: 127.0.0.1)
    #[argh(option)]
    host: Option<String>,

    /// the port to connect to (default: 9042)
    #[argh(option, short = 'p')]
    port: Option<u16>,

    /// optional credentials as user:password
    #[argh(option)]
    credentials: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let cli_args: CliArgs = argh::from_env();

    let level = if cli_args.debugging {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let address: IpAddr = cli_args.host.as_deref().unwrap_or("127.0.0.1").parse()?;
    let mut config = ConnectionConfig::default()
        .with_port(cli_args.port.unwrap_or(9042))
        .with_receive_timeout(Duration::from_secs(12))
        .with_send_timeout(Duration::from_secs(12));
    if let Some(credentials) = &cli_args.credentials {
        let (user, password) = credentials
            .split_once(':')
            .ok_or("credentials must be user:password")?;
        config = config.with_credentials(user, password);
    }

    let connection = Connection::open(address, &config, Arc::new(LogInstrumentation)).await?;
    println!("connected to {address}:{}", config.port);

    let mut done = false;
    let supported = connection
        .round_trip(
            |w| {
                w.set_opcode(Opcode::Options);
                Ok(())
            },
            move |r| {
                if done {
                    return Ok(None);
                }
                done = true;
                r.read_string_multimap().map(Some)
            },
            RequestToken(1),
        )
        .await?;

    for (option, values) in supported.into_iter().flatten() {
        println!("{option}: {}", values.join(", "));
    }

    connection.close();
    Ok(())
}
