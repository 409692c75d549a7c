use clap::{Parser, Subcommand};
use mini_registry::{
    setup_logging, ClientConfig, P2PClient, P2PError, RegistryServer, Result, ServerConfig,
};
use std::io::Write;
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};

#[derive(Parser)]
#[command(name = "mini-registry")]
#[command(about = "A registry-brokered P2P file sharing system")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the registry
    Server {
        /// Port to listen on
        port: u16,
        /// Address to bind
        #[arg(long)]
        bind: Option<String>,
        /// Log level (error, warn, info, debug, trace)
        #[arg(long)]
        log_level: Option<String>,
        /// JSON config file; flags override its values
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Run an interactive peer
    Client {
        /// Registry host name or address
        registry_host: String,
        /// Registry port
        registry_port: u16,
        /// This peer's id (must be non-zero)
        #[arg(value_parser = clap::value_parser!(u32).range(1..))]
        peer_id: u32,
        /// Directory whose files are published and served
        #[arg(long)]
        shared_dir: Option<PathBuf>,
        /// Directory fetched files are written to
        #[arg(long)]
        download_dir: Option<PathBuf>,
        /// Local port for the control connection and file server
        #[arg(long)]
        serve_port: Option<u16>,
        /// Shorthand for --log-level debug
        #[arg(short, long)]
        debug: bool,
        /// Log level (error, warn, info, debug, trace)
        #[arg(long)]
        log_level: Option<String>,
        /// JSON config file; flags override its values
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Server {
            port,
            bind,
            log_level,
            config,
        } => {
            let mut server_config = match config {
                Some(path) => ServerConfig::from_file(&path)?,
                None => ServerConfig::default(),
            };
            server_config.port = port;
            if let Some(bind) = bind {
                server_config.bind_addr = bind;
            }
            if let Some(level) = log_level {
                server_config.log_level = level;
            }

            setup_logging(server_config.log_level()?);
            RegistryServer::bind(&server_config).await?.run().await?;
        }
        Commands::Client {
            registry_host,
            registry_port,
            peer_id,
            shared_dir,
            download_dir,
            serve_port,
            debug,
            log_level,
            config,
        } => {
            let mut client_config = match config {
                Some(path) => ClientConfig::from_file(&path)?,
                None => ClientConfig::default(),
            };
            client_config.registry_host = registry_host;
            client_config.registry_port = registry_port;
            client_config.peer_id = peer_id;
            if let Some(dir) = shared_dir {
                client_config.shared_dir = dir;
            }
            if let Some(dir) = download_dir {
                client_config.download_dir = dir;
            }
            if let Some(port) = serve_port {
                client_config.serve_port = port;
            }
            if let Some(level) = log_level {
                client_config.log_level = level;
            }
            if debug {
                client_config.log_level = "debug".to_string();
            }

            setup_logging(client_config.log_level()?);
            let client = P2PClient::connect(&client_config).await?;
            run_repl(client).await?;
        }
    }

    Ok(())
}

async fn run_repl(mut client: P2PClient) -> Result<()> {
    println!(
        "Peer {} serving {} on port {}; downloads go to {}",
        client.peer_id(),
        client.shared_dir().display(),
        client.serve_addr().port(),
        client.download_dir().display()
    );
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    while let Some(line) = prompt(&mut lines, "Command: ").await? {
        let command = line.trim().to_ascii_uppercase();

        if command.starts_with("EXIT") {
            break;
        } else if command.starts_with("JOIN") {
            report(client.join().await);
        } else if command.starts_with("PUBLISH") {
            match client.publish_shared().await {
                Ok(files) => println!("Published {} file(s)", files.len()),
                Err(e) => eprintln!("Publish failed: {}", e),
            }
        } else if command.starts_with("SEARCH") {
            let Some(term) = prompt(&mut lines, "Filename: ").await? else {
                break;
            };
            match client.search(term.trim()).await {
                Ok(response) if response.is_found() => {
                    println!("File found at");
                    println!("\tPeer {}", response.peer_id);
                    println!("\t{}", response.socket_addr());
                }
                Ok(_) => println!("File not indexed by registry."),
                Err(e) => eprintln!("Search failed: {}", e),
            }
        } else if command.starts_with("FETCH") {
            let Some(name) = prompt(&mut lines, "Filename: ").await? else {
                break;
            };
            match client.fetch_to_disk(name.trim()).await {
                Ok(path) => println!("Saved {}", path.display()),
                Err(P2PError::FileNotFound(_)) => println!("File not indexed by registry."),
                Err(e) => eprintln!("Fetch failed: {}", e),
            }
        } else if command.starts_with("HELP") {
            println!("Commands:");
            for name in ["JOIN", "PUBLISH", "SEARCH", "FETCH", "HELP", "EXIT"] {
                println!("\t{}", name);
            }
        } else if !command.is_empty() {
            println!("Unknown command {:?}; try HELP", line.trim());
        }
    }

    Ok(())
}

async fn prompt(lines: &mut Lines<BufReader<Stdin>>, label: &str) -> Result<Option<String>> {
    print!("{}", label);
    std::io::stdout().flush()?;
    Ok(lines.next_line().await?)
}

fn report(result: Result<()>) {
    if let Err(e) = result {
        eprintln!("Command failed: {}", e);
    }
}
