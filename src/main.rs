use std::{error::Error, path::PathBuf, process, sync::Arc};

use clap::{command, Parser, ValueHint};
use log::{debug, error, info, warn, LevelFilter};
use tokio_util::sync::CancellationToken;
use url::Url;

use songbot::{
    api,
    batch::PlaylistBatcher,
    config::Config,
    http,
    pipeline::Pipeline,
    protocol::catalog::{MusicTrack, PlatformTracks},
    secrets::ApiKey,
    signal, tool,
};

/// Profile to display when not built in release mode.
#[cfg(debug_assertions)]
const BUILD_PROFILE: &str = "debug";
/// Profile to display when not built release mode.
#[cfg(not(debug_assertions))]
const BUILD_PROFILE: &str = "release";

/// Group name for mutually exclusive logging options.
const ARGS_GROUP_LOGGING: &str = "logging";

/// Command line arguments as parsed by `clap`.
#[derive(Clone, Debug, Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Track ids or platform URLs
    ///
    /// Ids are resolved with the metadata API. URLs of albums and playlists
    /// expand to all of their tracks.
    #[arg(required_unless_present = "search")]
    ids: Vec<String>,

    /// Package all tracks into one zip archive
    #[arg(short, long, default_value_t = false)]
    zip: bool,

    /// Search tracks instead of downloading
    #[arg(long, value_name = "QUERY", conflicts_with_all = ["ids", "zip"])]
    search: Option<String>,

    /// Maximum number of search results
    #[arg(long, requires = "search")]
    limit: Option<u32>,

    /// Download directory
    ///
    /// Holds the acquired files, which are reused by later runs.
    #[arg(short, long, env = "DOWNLOAD_PATH", value_hint = ValueHint::DirPath, default_value = Config::DEFAULT_DOWNLOAD_DIR)]
    download_dir: PathBuf,

    /// Metadata API base URL
    #[arg(long, env = "API_URL", value_hint = ValueHint::Url)]
    api_url: Option<Url>,

    /// Metadata API key
    #[arg(long, env = "API_KEY", hide_env_values = true)]
    api_key: Option<ApiKey>,

    /// Secrets file
    ///
    /// TOML file with an `api_key` entry, read when no key is given
    /// otherwise. Ensure that this file is kept secure and not shared
    /// publicly.
    #[arg(short, long, value_name = "FILE", value_hint = ValueHint::FilePath)]
    secrets_file: Option<PathBuf>,

    /// Suppresses all output except warnings and errors.
    #[arg(short, long, default_value_t = false, group = ARGS_GROUP_LOGGING)]
    quiet: bool,

    /// Enable verbose logging
    ///
    /// Specify twice for trace logging.
    #[arg(short, long, action = clap::ArgAction::Count, group = ARGS_GROUP_LOGGING)]
    verbose: u8,
}

/// Initializes the logger facade.
///
/// The logging level is determined as follows, in order of precedence from
/// highest to lowest:
/// 1. Command line arguments
/// 2. `RUST_LOG` environment variable
/// 3. Hard coded default
///
/// # Panics
///
/// Panics when a logger facade is already initialized.
fn init_logger(config: &Args) {
    let mut logger = env_logger::Builder::from_env(
        // Note: if you change the default logging level here, then you should
        // probably also change the verbosity levels below.
        env_logger::Env::default().filter_or(env_logger::DEFAULT_FILTER_ENV, "info"),
    );

    if config.quiet || config.verbose > 0 {
        let level = match config.verbose {
            0 => {
                // Quiet and verbose are mutually exclusive, and `verbose` is 0
                // by default. So this arm means: quiet mode.
                LevelFilter::Warn
            }
            1 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        };

        // Filter log messages of external crates.
        logger.filter_module(module_path!(), level);
    }

    logger.init();
}

/// Expands the command line inputs into playlist entries.
///
/// Platform URLs are looked up with the metadata API; anything else is
/// taken as a track id.
async fn resolve(
    api: &api::Client,
    inputs: &[String],
) -> songbot::error::Result<PlatformTracks> {
    let mut tracks = PlatformTracks::default();
    for input in inputs {
        if api::Client::is_valid(input) {
            let found = api.get_info(input).await?;
            debug!("{input} has {} tracks", found.results.len());
            tracks.results.extend(found.results);
        } else {
            tracks.results.push(MusicTrack {
                url: input.clone(),
                ..MusicTrack::default()
            });
        }
    }
    Ok(tracks)
}

/// Main application logic.
///
/// # Errors
///
/// Returns an error when the configuration is incomplete, the metadata API
/// fails, or when any requested track could not be acquired.
async fn run(args: Args) -> Result<(), Box<dyn Error>> {
    let mut config = Config::new(args.download_dir);
    config.api_url = args.api_url;
    config.api_key = match (args.api_key, args.secrets_file) {
        (Some(key), _) => Some(key),
        (None, Some(file)) => Some(ApiKey::from_file(file)?),
        (None, None) => None,
    };
    let config = Arc::new(config);

    let http = Arc::new(http::Client::new(&config)?);
    let api = api::Client::new(&config, Arc::clone(&http))?;

    if let Some(query) = args.search {
        for track in api.search(&query, args.limit).await?.results {
            println!("{}\t{} - {}\t{}", track.url, track.artist, track.name, track.platform);
        }
        return Ok(());
    }

    let runner = Arc::new(tool::System::new(config.tool_timeout));
    let pipeline = Arc::new(Pipeline::new(Arc::clone(&config), http, runner));

    let cancel = CancellationToken::new();
    let signals = signal::Handler::new()?;
    let shutdown = tokio::spawn(signals.cancel_on_signal(cancel.clone()));

    let playlist = resolve(&api, &args.ids).await?;
    let result = if args.zip {
        let batcher = PlaylistBatcher::new(pipeline);
        match batcher.acquire_playlist(&api, &playlist, &cancel).await {
            Ok(Some(archive)) => {
                println!("{}", archive.display());
                Ok(())
            }
            Ok(None) => Err("no track could be acquired".into()),
            Err(e) => Err(e.into()),
        }
    } else {
        let mut failures = 0;
        for entry in &playlist.results {
            if cancel.is_cancelled() {
                break;
            }

            let acquired = match api.get_track(&entry.url).await {
                Ok(track) => pipeline.acquire_with(&track, &cancel).await,
                Err(e) => Err(e),
            };

            match acquired {
                Ok(asset) => println!("{}", asset.audio),
                Err(e) => {
                    error!("{}: {e}", entry.url);
                    failures += 1;
                }
            }
        }

        if failures == 0 && !cancel.is_cancelled() {
            Ok(())
        } else {
            Err(format!("{failures} of {} tracks failed", playlist.results.len()).into())
        }
    };

    // Stop waiting for signals.
    cancel.cancel();
    if let Err(e) = shutdown.await {
        warn!("signal handler failed: {e}");
    }

    result
}

/// Main entry point of the application.
///
/// This function initializes the logger facade, parses the command line
/// arguments, and runs the requested downloads.
#[tokio::main]
async fn main() {
    // `clap` handles our command line arguments and help text.
    let args = Args::parse();
    init_logger(&args);

    // Dump command line arguments before we do anything more.
    // This aids in debugging of whatever comes next.
    debug!("Command {:#?}", args);

    let cmd = command!();
    let name = cmd.get_name().to_string();
    let version = cmd.get_version().unwrap_or("UNKNOWN").to_string();

    info!("starting {name}/{version}; {BUILD_PROFILE}");

    if let Err(e) = run(args).await {
        error!("{e}");
        process::exit(1);
    }
}
