use std::{path::PathBuf, sync::Arc, time::Duration};

use clap::Parser;
use fetchops_client::{
    LocalChannel, OperationChannel, Session, Teardown, UiEvent, WsChannel,
    config::{
        SavedClientConfig, load_config_from_path, save_config_to_path, validate_config,
    },
    logging::init_logging,
};
use fetchops_worker::CacheFetcher;
use tokio::{sync::mpsc, time::timeout};
use tracing::{debug, error, info, warn};

#[derive(Parser, Debug, Clone)]
#[command(name = "fetchops-client")]
struct ClientArgs {
    /// Websocket URL of a running fetchops-worker.
    #[arg(long)]
    worker_url: Option<String>,
    /// Run the worker inside this process instead of connecting to one.
    #[arg(long, default_value_t = false)]
    local: bool,
    /// Cache directory for the in-process worker.
    #[arg(long)]
    cache_dir: Option<PathBuf>,
    /// Rebuild the screen between requests, as a rotation would.
    #[arg(long, default_value_t = false)]
    rotate: bool,
    /// How long the UI waits for each reply before giving up on it.
    #[arg(long, default_value_t = 30)]
    reply_timeout_secs: u64,
    /// Saved JSON config; command-line flags take precedence.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Write the resolved config back to `--config`.
    #[arg(long, default_value_t = false)]
    save_config: bool,
    #[arg(long)]
    log_file: Option<PathBuf>,
    /// Resources to fetch, in order.
    locators: Vec<String>,
}

#[tokio::main]
async fn main() {
    let args = ClientArgs::parse();
    init_logging(args.log_file.as_deref());

    let config = match resolve_config(&args) {
        Ok(config) => config,
        Err(err) => {
            error!("config resolution failed: {}", err);
            std::process::exit(1);
        }
    };

    if args.locators.is_empty() {
        error!("nothing to fetch; pass one or more locators");
        std::process::exit(1);
    }

    let reply_timeout = Duration::from_secs(args.reply_timeout_secs);
    if let Err(err) = run(&config, &args.locators, args.rotate, reply_timeout).await {
        error!("client failed: {}", err);
        std::process::exit(1);
    }
}

fn resolve_config(args: &ClientArgs) -> Result<SavedClientConfig, String> {
    let mut config = match &args.config {
        Some(path) if path.exists() => {
            load_config_from_path(path).map_err(|err| format!("{}: {err}", path.display()))?
        }
        Some(path) => {
            warn!("config {} not found; using defaults", path.display());
            SavedClientConfig::default()
        }
        None => SavedClientConfig::default(),
    };

    if let Some(worker_url) = &args.worker_url {
        config.worker_url = worker_url.trim().to_owned();
    }
    if args.local {
        config.local = true;
    }
    if let Some(cache_dir) = &args.cache_dir {
        config.cache_dir = cache_dir.clone();
    }
    validate_config(&config)?;

    if args.save_config {
        let path = args
            .config
            .as_ref()
            .ok_or_else(|| "--save-config requires --config".to_owned())?;
        save_config_to_path(path, &config).map_err(|err| err.to_string())?;
        info!("saved config to {}", path.display());
    }

    Ok(config)
}

fn build_channel(config: &SavedClientConfig) -> Box<dyn OperationChannel> {
    if config.local {
        Box::new(LocalChannel::new(Arc::new(CacheFetcher::new(&config.cache_dir))))
    } else {
        Box::new(WsChannel::new(config.worker_url.clone()))
    }
}

async fn run(
    config: &SavedClientConfig,
    locators: &[String],
    rotate: bool,
    reply_timeout: Duration,
) -> Result<(), String> {
    let make_channel = || build_channel(config);
    let mut session = Session::new();

    let (ui_tx, mut ui_rx) = mpsc::unbounded_channel();
    let mut screen = session.screen(ui_tx, make_channel);

    for locator in locators {
        let controller = screen
            .controller()
            .ok_or_else(|| "controller missing from session".to_owned())?;
        controller
            .wait_until_bound()
            .await
            .map_err(|err| format!("could not bind to worker: {err}"))?;

        match timeout(reply_timeout, controller.submit_and_wait(locator)).await {
            Ok(Ok(event)) => print_event(locator, &event),
            Ok(Err(err)) => {
                println!("{locator}: rejected ({err})");
                continue;
            }
            Err(_) => {
                // Still in flight; the controller cannot take new work until an
                // unbind, so stop here.
                warn!(
                    request_id = ?controller.in_flight(),
                    "no reply within {:?}",
                    reply_timeout
                );
                println!("{locator}: no reply within {reply_timeout:?}");
                break;
            }
        }
        // The same outcome was published to the ui sink.
        while let Ok(event) = ui_rx.try_recv() {
            debug!(?event, "ui event");
        }

        if rotate {
            screen.on_destroy(Teardown::Rebuild);
            let (rebuilt_tx, rebuilt_rx) = mpsc::unbounded_channel();
            ui_rx = rebuilt_rx;
            screen = session.screen(rebuilt_tx, make_channel);
            info!(start = ?screen.start(), "screen rebuilt");
            // The restored controller replays its last outcome to the new screen.
            while let Ok(event) = ui_rx.try_recv() {
                info!(?event, "restored outcome");
            }
        }
    }

    screen.on_destroy(Teardown::Finish);
    session.end();
    Ok(())
}

fn print_event(locator: &str, event: &UiEvent) {
    match event {
        UiEvent::Succeeded {
            request_id,
            result_locator,
            ..
        } => println!("{locator}: fetched as {result_locator} (request {request_id})"),
        UiEvent::Failed { request_id } => println!("{locator}: failed (request {request_id})"),
    }
}
