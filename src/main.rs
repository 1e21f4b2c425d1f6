use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use schoolhub::config::ensure_auth_cookie;
use schoolhub::live::{
    LiveClassManager, LiveSession, MediaStream, MediaTrack, PeerId, RtcNetwork, SessionEvent,
};
use schoolhub::server::ProviderVerifier;
use schoolhub::{Config, PortalServer, PortalStore, SchoolScope};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "schoolhub")]
#[command(about = "Multi-tenant school portal with live classes", long_about = None)]
struct Cli {
    #[arg(long, default_value = "./schoolhub-data", global = true)]
    data_dir: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the portal server
    Start {
        #[arg(long)]
        addr: Option<String>,
    },
    /// List collections and record counts
    Collections,
    /// Print the records of a collection
    Get {
        collection: String,
        /// Only records of this school
        #[arg(long)]
        school: Option<String>,
        /// Only publicly visible records (requires --school)
        #[arg(long)]
        published: bool,
    },
    /// Insert a record from JSON
    Insert {
        collection: String,
        json: String,
        #[arg(long)]
        school: String,
    },
    /// Merge JSON fields into a record
    Update {
        collection: String,
        id: String,
        json: String,
        #[arg(long)]
        school: String,
    },
    /// Delete a record
    Delete {
        collection: String,
        id: String,
        #[arg(long)]
        school: String,
    },
    /// Get storage statistics
    Stats,
    /// Join a live class through the signaling broker
    Live {
        /// Our peer id (random if omitted)
        #[arg(long)]
        peer_id: Option<String>,
        /// Peers to call once joined
        #[arg(long)]
        connect: Vec<String>,
        /// Broker URL, overriding the config file
        #[arg(long)]
        signaling_url: Option<String>,
    },
}

fn open_store(cli_dir: &PathBuf, config: &Config) -> Result<PortalStore> {
    // Use data dir from config if not overridden by CLI
    let data_dir = if cli_dir.to_str() == Some("./schoolhub-data") {
        PathBuf::from(&config.storage.data_dir)
    } else {
        cli_dir.clone()
    };
    PortalStore::with_map_size(&data_dir, config.storage.map_size())
        .with_context(|| format!("Failed to open store at {}", data_dir.display()))
}

fn parse_json(json: &str) -> Result<serde_json::Value> {
    serde_json::from_str(json).context("Invalid JSON")
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = Config::load()?;

    match cli.command {
        Commands::Start { addr } => {
            let addr = addr.unwrap_or_else(|| config.server.bind_address.clone());
            let store = Arc::new(open_store(&cli.data_dir, &config)?);

            let verifier = ProviderVerifier::new(config.payments.clone());
            let mut server = PortalServer::new(store, addr.clone()).with_verifier(Arc::new(verifier));

            println!("Starting schoolhub on {}", addr);
            println!("Live signaling: ws://{}/live/<peer-id>", addr);
            println!("Payment callback: http://{}/payments/callback", addr);
            let providers = config.payments.providers();
            if providers.is_empty() {
                println!("Payments: no provider keys, callbacks will be refused");
            } else {
                println!("Payments: verified with {}", providers.join(", "));
            }

            if config.server.enable_auth {
                let (username, password) = ensure_auth_cookie()?;
                println!("Auth: {}:{}", username, password);
                server = server.with_auth(username, password);
            } else {
                println!("Auth: disabled");
            }

            server.run().await?;
        }
        Commands::Collections => {
            let store = open_store(&cli.data_dir, &config)?;
            let stats = store.stats()?;
            if stats.collections.is_empty() {
                println!("No collections");
            } else {
                for (name, count) in &stats.collections {
                    println!("  {} ({} records)", name, count);
                }
            }
        }
        Commands::Get {
            collection,
            school,
            published,
        } => {
            let store = Arc::new(open_store(&cli.data_dir, &config)?);
            let records = match school {
                Some(school) => {
                    let scope = SchoolScope::new(store, school);
                    if published {
                        scope.published(&collection)?
                    } else {
                        scope.get(&collection)?
                    }
                }
                None if published => anyhow::bail!("--published requires --school"),
                None => store.get(&collection)?,
            };
            println!("{}", serde_json::to_string_pretty(&records)?);
        }
        Commands::Insert {
            collection,
            json,
            school,
        } => {
            let store = Arc::new(open_store(&cli.data_dir, &config)?);
            let record = SchoolScope::new(store, school).insert(&collection, parse_json(&json)?)?;
            println!("{}", serde_json::to_string_pretty(&record)?);
        }
        Commands::Update {
            collection,
            id,
            json,
            school,
        } => {
            let store = Arc::new(open_store(&cli.data_dir, &config)?);
            let record =
                SchoolScope::new(store, school).update(&collection, &id, parse_json(&json)?)?;
            println!("{}", serde_json::to_string_pretty(&record)?);
        }
        Commands::Delete {
            collection,
            id,
            school,
        } => {
            let store = Arc::new(open_store(&cli.data_dir, &config)?);
            if SchoolScope::new(store, school).delete(&collection, &id)? {
                println!("Deleted: {}/{}", collection, id);
            } else {
                println!("Not found: {}/{}", collection, id);
            }
        }
        Commands::Stats => {
            let store = open_store(&cli.data_dir, &config)?;
            let stats = store.stats()?;
            println!("Storage Statistics:");
            println!("  Collections: {}", stats.collections.len());
            println!("  Total records: {}", stats.total_records);
            println!(
                "  Total size: {} bytes ({:.2} KB)",
                stats.total_bytes,
                stats.total_bytes as f64 / 1024.0
            );
        }
        Commands::Live {
            peer_id,
            connect,
            signaling_url,
        } => {
            let mut live_config = config.live.clone();
            if let Some(url) = signaling_url {
                live_config.signaling_url = url;
            }
            let local_id = peer_id.map(PeerId::from).unwrap_or_else(PeerId::random);

            let (network, network_events) = RtcNetwork::connect(local_id.clone(), live_config).await?;
            let (manager, mut events) = LiveClassManager::new(network);
            let (session, task) = LiveSession::spawn(manager, network_events);

            let stream_id = format!("{}-stream", local_id);
            session
                .start(MediaStream::new(
                    stream_id.clone(),
                    vec![
                        MediaTrack::audio(format!("{}-audio", stream_id)),
                        MediaTrack::video(format!("{}-video", stream_id)),
                    ],
                ))
                .await?;
            println!("Joined live class as {}", local_id);

            for peer in connect {
                if session.connect(peer.as_str()).await? {
                    println!("Calling {}", peer);
                }
            }

            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => break,
                    event = events.recv() => {
                        let Some(event) = event else { break };
                        match event {
                            SessionEvent::RemoteStream { peer_id, stream } => {
                                println!("{} joined ({} tracks)", peer_id, stream.tracks.len());
                                session
                                    .broadcast(serde_json::json!({ "hello": local_id.as_str() }))
                                    .await?;
                            }
                            SessionEvent::PeerLeft { peer_id } => println!("{} left", peer_id),
                            SessionEvent::Data { peer_id, data } => println!("{}: {}", peer_id, data),
                        }
                    }
                }
            }

            session.destroy().await?;
            task.await?;
        }
    }

    Ok(())
}
