//! friend-network CLI
//!
//! Generates the mutual-friend network visualization and manages the local
//! data it keeps between runs.

use clap::{Parser, Subcommand};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use friend_network::export::open_in_browser;
use friend_network::{
    Config, CookieSession, DataLayout, HttpMutualsApi, MutualCache, NetworkError, Pipeline,
    PipelineRunner, Progress, Result, RetryPolicy, RunOutcome, Session, clear_user_data,
    load_friend_csv,
};

#[derive(Parser)]
#[command(name = "friend-network")]
#[command(about = "Map and cluster the mutual connections in your friend list")]
#[command(version)]
struct Cli {
    /// Directory holding the cache, session and generated files
    #[arg(long, env = "FRIEND_NETWORK_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// TOML configuration file
    #[arg(long, env = "FRIEND_NETWORK_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch mutual connections and write the network visualization
    Generate {
        /// CSV friend list with `user_id,display_name` columns
        #[arg(short, long)]
        friends: PathBuf,
        /// Open the result in the default browser
        #[arg(long)]
        open: bool,
        /// Start the page in dark mode
        #[arg(long)]
        dark_mode: bool,
        /// Also write a Graphviz file
        #[arg(long)]
        dot: bool,
    },
    /// Delete the cache, saved session and generated files
    Clear,
    /// Manage the saved session
    Session {
        #[command(subcommand)]
        action: SessionAction,
    },
    /// Inspect the mutual-friend cache
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },
}

#[derive(Subcommand)]
enum SessionAction {
    /// Save auth cookies from an existing login
    Import {
        #[arg(long, env = "FRIEND_NETWORK_AUTH_COOKIE")]
        auth_cookie: String,
        #[arg(long)]
        two_factor_cookie: Option<String>,
    },
    /// Report whether a usable session is saved
    Status,
}

#[derive(Subcommand)]
enum CacheAction {
    /// Count cached results by status
    Status,
}

fn main() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "friend_network=info".into()))
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .init();

    let cli = Cli::parse();
    if let Err(e) = run(cli) {
        eprintln!("Error: {}", e.user_message());
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    let mut config = Config::load(cli.config.as_deref())?;
    let layout = DataLayout::new(cli.data_dir.unwrap_or_else(DataLayout::default_root));

    match cli.command {
        Commands::Generate {
            friends,
            open,
            dark_mode,
            dot,
        } => {
            config.export.dark_mode |= dark_mode;
            config.export.dot |= dot;
            generate(config, layout, friends, open)
        }
        Commands::Clear => {
            let removed = clear_user_data(&layout)?;
            if removed.is_empty() {
                println!("Nothing to remove in {}", layout.root.display());
            }
            for path in removed {
                println!("Removed {}", path.display());
            }
            Ok(())
        }
        Commands::Session { action } => match action {
            SessionAction::Import {
                auth_cookie,
                two_factor_cookie,
            } => {
                let mut session = CookieSession::new(auth_cookie);
                if let Some(cookie) = two_factor_cookie {
                    session = session.with_two_factor(cookie);
                }
                if !session.authenticated() {
                    return Err(NetworkError::AuthenticationRequired);
                }
                session.save(&layout.session_file())?;
                println!("Session saved to {}", layout.session_file().display());
                Ok(())
            }
            SessionAction::Status => {
                match CookieSession::restore(&layout.session_file())? {
                    Some(session) if session.authenticated() => println!("Session saved"),
                    _ => println!("No session saved; run `friend-network session import`"),
                }
                Ok(())
            }
        },
        Commands::Cache { action } => match action {
            CacheAction::Status => {
                let cache = MutualCache::open(layout.cache_file(), None)?;
                let counts = cache.counts();
                println!("Cache: {}", cache.path().display());
                println!("  ok:           {}", counts.ok);
                println!("  not found:    {}", counts.not_found);
                println!("  rate limited: {}", counts.rate_limited);
                println!("  error:        {}", counts.error);
                println!("  total:        {}", counts.total());
                Ok(())
            }
        },
    }
}

fn generate(config: Config, layout: DataLayout, friends: PathBuf, open: bool) -> Result<()> {
    let records = load_friend_csv(&friends)?;
    let session = CookieSession::restore(&layout.session_file())?
        .ok_or(NetworkError::AuthenticationRequired)?;
    let api = HttpMutualsApi::new(config.api.clone())?
        .with_min_interval(RetryPolicy::from(&config.fetch).min_interval);

    let runner = PipelineRunner::new(Pipeline::new(
        config,
        layout,
        Arc::new(api),
        Arc::new(session),
    ));
    let handle = runner.spawn(records)?;

    let outcome = handle.wait_with(|progress| match progress {
        Progress::Stage(stage) => {
            eprintln!("{}", stage);
        }
        Progress::Fetched { completed, total } => {
            eprint!("\r  {}/{} ({}%)", completed, total, progress.percent().unwrap_or(0));
            if completed == total {
                eprintln!();
            }
            let _ = io::stderr().flush();
        }
    })?;

    match outcome {
        RunOutcome::Completed(report) => {
            println!("{}", report);
            if let Some(html) = &report.html_path {
                println!("Wrote {}", html.display());
                if open {
                    if let Err(e) = open_in_browser(html) {
                        warn!(error = %e, "Could not open browser");
                    }
                }
            }
        }
        RunOutcome::Cancelled(report) => {
            info!("Run cancelled; cached results will be reused next time");
            println!("Cancelled: {}", report);
        }
    }
    Ok(())
}
