use clap::{Args, Parser, Subcommand};
use hyper::Method;
use std::os::fd::AsRawFd;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncBufReadExt;
use tracing::{debug, info};

use boardwalk::agent::{self, AgentContext};
use boardwalk::auth::TokenStore;
use boardwalk::cert::AgentCertificate;
use boardwalk::config::{self, Config};
use boardwalk::errors::{AgentError, Result};
use boardwalk::logging::{self, LogConfig, LogLevel};
use boardwalk::pidfile::{self, PidFile};
use boardwalk::signaling::client as sock_client;

#[derive(Parser, Debug)]
#[command(
    name = "boardwalk",
    about = "Execute commands and pipe their stdin & stdout over WebRTC data channels",
    disable_version_flag = true
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Spawns the agent: a signalling server and WebRTC peer
    Start(StartArgs),
    /// Stops the agent
    Stop,
    /// Restarts the agent
    Restart(AddressArg),
    /// Prints the agent's status
    Status,
    /// Initializes the conf directory, configuration and certificate
    Init,
    /// Accepts an offer to connect, relayed from stdin
    Accept(AddressArg),
    /// Prints version information
    Version,
}

#[derive(Args, Debug, Default)]
struct StartArgs {
    #[arg(
        long,
        short = 'a',
        value_name = "ADDRESS",
        help = "The address the signalling http server listens on"
    )]
    address: Option<String>,

    #[arg(long, help = "Run as the agent, in the background")]
    agent: bool,

    #[arg(long, help = "Run in debug mode in the foreground")]
    debug: bool,

    #[arg(
        long = "log-level",
        value_enum,
        value_name = "LEVEL",
        help = "Override the configured log level"
    )]
    log_level: Option<LogLevel>,
}

#[derive(Args, Debug, Default)]
struct AddressArg {
    #[arg(long, short = 'a', value_name = "ADDRESS")]
    address: Option<String>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let result = match cli.command {
        Command::Start(args) => start(args).await,
        Command::Stop => stop().await,
        Command::Restart(args) => restart(args).await,
        Command::Status => status().await,
        Command::Init => init().await,
        Command::Accept(args) => accept(args).await,
        Command::Version => {
            print_version();
            Ok(())
        }
    };
    if let Err(err) = result {
        eprintln!("{err}");
        std::process::exit(err.exit_code());
    }
}

fn print_version() {
    println!("Version: {}", env!("CARGO_PKG_VERSION"));
    println!(
        "Git Commit Hash: {}",
        option_env!("BUILD_COMMIT").unwrap_or("0000000")
    );
    println!(
        "Build Date: {}",
        option_env!("BUILD_DATE").unwrap_or("0000-00-00T00:00:00+0000")
    );
}

async fn start(args: StartArgs) -> Result<()> {
    let conf_file = config::conf_path(config::CONF_FILE)?;
    let mut config = Config::load(&conf_file)?;
    if let Some(level) = args.log_level {
        config.log_level = level.as_str().to_string();
    }
    let address = args
        .address
        .clone()
        .unwrap_or_else(|| config.http_server.clone());

    let mut pid_file = None;
    if args.debug {
        logging::init(&LogConfig {
            filter: config.tracing_filter(),
            file: None,
        })?;
    } else if args.agent {
        let log_file = config
            .log_file
            .clone()
            .unwrap_or(config::conf_path("agent.log")?);
        logging::init(&LogConfig {
            filter: config.tracing_filter(),
            file: Some(log_file),
        })?;
        redirect_stderr(&config)?;
        pid_file = Some(PidFile::create(&config::pid_path()?)?);
    } else {
        return fork_agent(&address);
    }

    let certificate = AgentCertificate::load_or_generate(&config::conf_path(config::CERT_FILE)?)?;
    let tokens = TokenStore::new(config::conf_path(config::TOKENS_FILE)?);
    info!(address, fingerprint = certificate.fingerprint(), "agent starting");
    let ctx = AgentContext::new(config, Some(conf_file), certificate, tokens);

    let result = agent::run(ctx, &address).await;
    drop(pid_file);
    result
}

/// Agent mode keeps panics and library prints out of the PTY stream.
fn redirect_stderr(config: &Config) -> Result<()> {
    let Some(path) = &config.err_file else {
        return Ok(());
    };
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|err| AgentError::Config(format!("open {}: {err}", path.display())))?;
    nix::unistd::dup2(file.as_raw_fd(), 2)
        .map_err(|err| AgentError::Config(format!("redirect stderr: {err}")))?;
    std::mem::forget(file);
    Ok(())
}

fn fork_agent(address: &str) -> Result<()> {
    if let Some(pid) = pidfile::read_running(&config::pid_path()?)? {
        println!("agent is already running with process id {pid}");
        return Ok(());
    }
    let exe = std::env::current_exe()?;
    let child = std::process::Command::new(exe)
        .args(["start", "--agent", "--address", address])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .map_err(|err| AgentError::Config(format!("agent failed to start: {err}")))?;
    std::thread::sleep(Duration::from_millis(100));
    println!("agent started as process #{}", child.id());
    Ok(())
}

async fn stop() -> Result<()> {
    let pid = pidfile::read_running(&config::pid_path()?)?
        .ok_or_else(|| AgentError::NotFound("running agent".into()))?;
    println!("sending SIGINT to agent process {pid}");
    nix::sys::signal::kill(
        nix::unistd::Pid::from_raw(pid),
        nix::sys::signal::Signal::SIGINT,
    )
    .map_err(|err| AgentError::Config(format!("signal agent {pid}: {err}")))?;
    Ok(())
}

async fn restart(args: AddressArg) -> Result<()> {
    match stop().await {
        Ok(()) | Err(AgentError::NotFound(_)) => {}
        Err(err) => return Err(err),
    }
    // Give the old agent a moment to release the socket and PID file.
    tokio::time::sleep(Duration::from_secs(1)).await;
    start(StartArgs {
        address: args.address,
        ..StartArgs::default()
    })
    .await
}

async fn status() -> Result<()> {
    match pidfile::read_running(&config::pid_path()?)? {
        None => println!("agent is not running"),
        Some(pid) => {
            println!("agent is running with process id {pid}");
            let socket = config::socket_path()?;
            if let Ok((status, body)) =
                sock_client::request(&socket, Method::GET, "/status", None).await
            {
                if status.is_success() {
                    print!("{body}");
                }
            }
        }
    }
    Ok(())
}

async fn init() -> Result<()> {
    logging::init(&LogConfig {
        filter: "boardwalk=info".into(),
        file: None,
    })?;
    let dir = config::conf_dir()?;
    let config = config::create_default_conf(&dir)?;
    println!("created {:?} directory", dir);

    let cert_path = dir.join(config::CERT_FILE);
    let certificate = AgentCertificate::generate()?;
    certificate.save(&cert_path)?;
    println!(" {} - certificate file", cert_path.display());
    println!(" fingerprint: {}", certificate.fingerprint());

    if let Some(host) = &config.peerbook_host {
        let client = boardwalk::peerbook::PeerbookClient::new(host)?;
        let verified = client
            .verify_peer(
                certificate.fingerprint(),
                config.peerbook.name.as_deref().unwrap_or_default(),
                config.peerbook.uid.as_deref().unwrap_or_default(),
            )
            .await?;
        if verified {
            println!("** verified ** by peerbook");
        } else {
            println!("** unverified ** peerbook sent you a verification email.");
        }
    }
    Ok(())
}

async fn accept(args: AddressArg) -> Result<()> {
    logging::init(&LogConfig {
        filter: "boardwalk=warn".into(),
        file: None,
    })?;
    let socket = config::socket_path()?;

    if pidfile::read_running(&config::pid_path()?)?.is_none() {
        let address = match args.address {
            Some(address) => address,
            None => Config::load(&config::conf_path(config::CONF_FILE)?)?.http_server,
        };
        fork_agent(&address)?;
        wait_for_socket(&socket).await?;
    }

    let mut peer_id: Option<String> = None;
    let mut printer: Option<tokio::task::JoinHandle<()>> = None;
    let stdin = tokio::io::BufReader::new(tokio::io::stdin());
    let mut lines = stdin.lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim().to_string();
        if line.is_empty() {
            continue;
        }
        match &peer_id {
            None => {
                let (status, body) =
                    sock_client::request(&socket, Method::POST, "/offer/", Some(line)).await?;
                if !status.is_success() {
                    return Err(AgentError::Transport(format!(
                        "agent returned an error: {body}"
                    )));
                }
                let parsed: serde_json::Value = serde_json::from_str(&body).map_err(|err| {
                    AgentError::Protocol(format!("bad answer from agent: {err}"))
                })?;
                let id = parsed["id"]
                    .as_str()
                    .ok_or_else(|| AgentError::Protocol("answer carries no peer id".into()))?
                    .to_string();
                println!("{body}");
                printer = Some(spawn_candidate_printer(socket.clone(), id.clone()));
                peer_id = Some(id);
            }
            Some(id) => {
                let uri = format!("/offer/{id}");
                let (status, body) =
                    sock_client::request(&socket, Method::PUT, &uri, Some(line)).await?;
                if !status.is_success() {
                    return Err(AgentError::Transport(format!(
                        "candidate rejected: {body}"
                    )));
                }
            }
        }
    }
    if let Some(printer) = printer {
        let _ = printer.await;
    }
    Ok(())
}

/// Relays locally gathered candidates to stdout until the agent reports
/// that gathering is complete.
fn spawn_candidate_printer(socket: PathBuf, id: String) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let uri = format!("/offer/{id}");
        loop {
            match sock_client::request(&socket, Method::GET, &uri, None).await {
                Ok((status, body)) if status.as_u16() == 200 => println!("{body}"),
                Ok((status, _)) => {
                    debug!(status = status.as_u16(), "candidate poll finished");
                    break;
                }
                Err(err) => {
                    eprintln!("candidate poll failed: {err}");
                    break;
                }
            }
        }
    })
}

/// The freshly forked agent needs a beat to bind its socket.
async fn wait_for_socket(socket: &PathBuf) -> Result<()> {
    for _ in 0..30 {
        if tokio::net::UnixStream::connect(socket).await.is_ok() {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    Err(AgentError::Timeout(format!(
        "agent socket {} never came up",
        socket.display()
    )))
}
