use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use hangish::config::AuthConfig;
use hangish::{
    AuthError, AuthOutcome, AuthSession, ChannelEvent, Client, ClientConfig, CookieFile,
    CookieStore, FileConfig, HangishPaths, ReqwestTransport, SessionContext, SessionCookieSet,
};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::prelude::*;

/// Wrong PINs tolerated before giving up.
const PIN_ATTEMPTS: usize = 3;

#[derive(Parser)]
#[command(name = "hangish")]
#[command(about = "Sign in and listen to the chat push channel")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Custom data directory (defaults to ~/.hangish)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Sign in with email and password and store the session cookies
    Login,
    /// Connect with the stored cookies and print push updates until Ctrl-C
    Listen,
    /// Delete the stored session cookies
    Logout,
    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.debug);

    let paths = HangishPaths::new(cli.data_dir)?;
    let file_config = FileConfig::load(&paths.data_dir)
        .with_context(|| format!("Failed to load {}", paths.config_toml_path().display()))?;

    match cli.command {
        Commands::Login => login(&paths, &file_config).await,
        Commands::Listen => listen(&paths, &file_config).await,
        Commands::Logout => logout(&paths, &file_config),
        Commands::Config => {
            print!("{}", file_config.render()?);
            Ok(())
        }
    }
}

fn init_logging(debug: bool) {
    let default_directive = if debug { "hangish=debug,info" } else { "hangish=info,warn" };
    let env_filter = tracing_subscriber::EnvFilter::try_from_env("HANGISH_LOG")
        .or_else(|_| tracing_subscriber::EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(env_filter)
        .init();
}

fn session(paths: &HangishPaths, fc: &FileConfig) -> Result<AuthSession<ReqwestTransport>> {
    let config = AuthConfig::from_file(&fc.auth);
    let transport = ReqwestTransport::new()?;
    let ctx = SessionContext::new(
        transport,
        CookieStore::new(SessionCookieSet::new()),
        config.user_agent.clone(),
    );
    Ok(AuthSession::new(ctx, config, CookieFile::new(paths.cookie_path())))
}

async fn login(paths: &HangishPaths, fc: &FileConfig) -> Result<()> {
    let mut auth = session(paths, fc)?;
    let mut outcome = auth.authenticate().await?;
    if matches!(outcome, AuthOutcome::Authenticated(_)) {
        eprintln!("Already signed in. Run `hangish logout` first to switch accounts.");
        return Ok(());
    }

    let mut wrong_pins = 0;
    loop {
        outcome = match outcome {
            AuthOutcome::Authenticated(cookies) => {
                eprintln!(
                    "Signed in; {} cookies stored in {}",
                    cookies.len(),
                    paths.cookie_path().display()
                );
                return Ok(());
            }
            AuthOutcome::CredentialsRequired => {
                let (email, password) = prompt_credentials().await?;
                match auth.submit_credentials(&email, &password).await {
                    Err(AuthError::WrongCredentials) => {
                        eprintln!("  (wrong email or password, try again)");
                        auth.fetch_galx_token().await?
                    }
                    other => other?,
                }
            }
            AuthOutcome::SecondFactorRequired => {
                let pin = prompt_secret("  Verification code: ").await?;
                match auth.submit_second_factor_pin(pin.trim()).await {
                    Err(AuthError::WrongSecondFactorPin) if wrong_pins + 1 < PIN_ATTEMPTS => {
                        wrong_pins += 1;
                        eprintln!("  (wrong code, try again)");
                        AuthOutcome::SecondFactorRequired
                    }
                    other => other?,
                }
            }
        };
    }
}

async fn listen(paths: &HangishPaths, fc: &FileConfig) -> Result<()> {
    let mut auth = session(paths, fc)?;
    if !CookieFile::new(paths.cookie_path()).exists() {
        bail!("Not signed in; run `hangish login` first");
    }
    let AuthOutcome::Authenticated(cookies) = auth.authenticate().await? else {
        bail!("Stored cookies were rejected; run `hangish login` again");
    };

    let config = AuthConfig::from_file(&fc.auth);
    let ctx = SessionContext::new(
        ReqwestTransport::new()?,
        CookieStore::new(cookies),
        config.user_agent,
    );
    let client = match Client::connect(
        ctx,
        ClientConfig::from_file(fc),
        CookieFile::new(paths.cookie_path()),
    )
    .await
    {
        Ok(client) => client,
        Err(e) if e.is_session_stale() => {
            auth.forget()?;
            bail!("Session expired ({e}); run `hangish login` again");
        }
        Err(e) => return Err(e.into()),
    };
    info!(api_key_len = client.startup().api_key.len(), "connected");

    let mut events = client.subscribe_channel();
    loop {
        let event = tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => event,
        };
        match event {
            Ok(ChannelEvent::StatusChanged(status)) => {
                eprintln!("channel {status}");
                if status.is_terminal() {
                    break;
                }
            }
            Ok(ChannelEvent::BatchUpdate(update)) => {
                println!("{}", hangish_wire::encode_to_string(&update));
            }
            Ok(ChannelEvent::Restored { last_push }) => {
                let since = last_push.map_or_else(|| "start".to_string(), |at| at.to_rfc3339());
                eprintln!("channel restored; updates since {since} may be missing");
            }
            Ok(ChannelEvent::FrameDropped { reason }) => warn!(%reason, "frame dropped"),
            Ok(_) => {}
            Err(RecvError::Lagged(n)) => warn!(skipped = n, "listener fell behind"),
            Err(RecvError::Closed) => break,
        }
    }

    client.shutdown().await;
    Ok(())
}

fn logout(paths: &HangishPaths, fc: &FileConfig) -> Result<()> {
    session(paths, fc)?.forget()?;
    eprintln!("Signed out.");
    Ok(())
}

async fn prompt_credentials() -> Result<(String, String)> {
    tokio::task::spawn_blocking(|| -> Result<(String, String)> {
        use std::io::{self, BufRead, Write};

        let email = loop {
            eprint!("  Email: ");
            io::stderr().flush()?;
            let mut line = String::new();
            io::stdin().lock().read_line(&mut line)?;
            let trimmed = line.trim().to_string();
            if !trimmed.is_empty() {
                break trimmed;
            }
        };
        let password = rpassword::prompt_password("  Password: ")
            .map_err(|e| anyhow::anyhow!("Failed to read password: {}", e))?;
        Ok((email, password))
    })
    .await?
}

async fn prompt_secret(prompt: &'static str) -> Result<String> {
    tokio::task::spawn_blocking(move || {
        rpassword::prompt_password(prompt)
            .map_err(|e| anyhow::anyhow!("Failed to read input: {}", e))
    })
    .await?
}
