use std::{sync::Arc, time::Duration};

use anyhow::{Result, anyhow};
use clap::{ArgAction, Parser, Subcommand};
use roomlink::{
    app::{App, DEFAULT_COLOR, LogRenderer},
    config::{Config, SignalingConfig, default_ice_servers},
    game::Input,
    provider::peerjs::PeerJsProvider,
    session::Session,
};
use tokio::{
    io::{AsyncBufReadExt, BufReader, stdin},
    signal::ctrl_c,
    sync::watch,
};
use tracing::{info, warn};
use webrtc::ice_transport::ice_server::RTCIceServer;

#[derive(Debug, Parser)]
struct Args {
    #[clap(subcommand)]
    command: Command,
    #[clap(env, long, short)]
    name: String,
    #[clap(env, long, short, default_value = DEFAULT_COLOR)]
    color: String,
    #[clap(env, long, default_value = "0.peerjs.com")]
    signaling_host: String,
    #[clap(env, long, default_value_t = 443)]
    signaling_port: u16,
    #[clap(env, long, default_value = "/")]
    signaling_path: String,
    #[clap(env, long, default_value = "peerjs")]
    signaling_key: String,
    #[clap(env, long, default_value_t = true, action = ArgAction::Set)]
    signaling_secure: bool,
    #[clap(env, long, short, value_parser = parse_rtc_ice_server, value_delimiter = ',')]
    ice_servers: Vec<RTCIceServer>,
    #[clap(env, long, value_parser = humantime::parse_duration, default_value = "5s")]
    heartbeat_interval: Duration,
    #[clap(env, long, value_parser = humantime::parse_duration, default_value = "16ms 667us")]
    frame_interval: Duration,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Open a new room and wait for players.
    Host {
        #[clap(long)]
        code: Option<String>,
    },
    /// Join the room with the given code.
    Join { code: String },
}

fn parse_rtc_ice_server(input: &str) -> Result<RTCIceServer> {
    let splited: Vec<_> = input.split('|').collect();
    if splited.len() == 1 {
        Ok(RTCIceServer {
            urls: vec![splited[0].to_string()],
            ..Default::default()
        })
    } else if splited.len() == 3 {
        Ok(RTCIceServer {
            urls: vec![splited[0].to_string()],
            username: splited[1].to_string(),
            credential: splited[2].to_string(),
            ..Default::default()
        })
    } else {
        Err(anyhow!("Unexpected ice server: {input}"))
    }
}

// each line replaces the held keys, an empty line releases them
fn read_keys(keys: watch::Sender<Input>) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stdin()).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    let Ok(input) = line.parse::<Input>();
                    if keys.send(input).is_err() {
                        break;
                    }
                },
                Ok(None) => break,
                Err(err) => {
                    warn!("failed to read input: {err}");
                    break;
                },
            }
        }
    });
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let args = Args::parse();

    let config = Config {
        signaling: SignalingConfig {
            host: args.signaling_host,
            port: args.signaling_port,
            path: args.signaling_path,
            key: args.signaling_key,
            secure: args.signaling_secure,
        },
        ice_servers: if args.ice_servers.is_empty() { default_ice_servers() } else { args.ice_servers },
        heartbeat_interval: args.heartbeat_interval,
    };
    let (session, actor) = Session::spawn(Arc::new(PeerJsProvider::new(config))).await?;
    let mut app = App::new(session.clone(), LogRenderer::default())?;

    match args.command {
        Command::Host { code } => {
            let code = code.map(|code| code.parse()).transpose()?;
            let code = app.host_game_with(code, &args.name, &args.color).await?;
            println!("Room Code: {code}");
        },
        Command::Join { code } => {
            app.join_game(&code, &args.name, &args.color).await?;
            println!("Room Code: {code}");
        },
    }

    let (keys, input) = watch::channel(Input::default());
    read_keys(keys);
    app.run(input, args.frame_interval, async {
        if let Err(err) = ctrl_c().await {
            warn!("failed to listen for ctrl-c: {err}");
        }
    })
    .await?;

    session.stop();
    actor.await?;
    info!("bye");
    Ok(())
}
