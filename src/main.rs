use color_eyre::{eyre::eyre, Result};
use mqttdeck::config::AppConfig;
use mqttdeck::console::{render_event, Command, Console, HELP};
use mqttdeck::mqtt::{MqttHandle, MqttHandler, WsConnector};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::{fmt, prelude::*, reload, Registry};

type LogLevelHandle = reload::Handle<LevelFilter, Registry>;

#[tokio::main]
async fn main() -> Result<()> {
    let log_level = setup()?;

    let config = setup_config().await?;
    log_level
        .modify(|filter| *filter = LevelFilter::from_level(config.level()))
        .map_err(|e| eyre!("Failed to apply log level: {}", e))?;
    info!("Broker endpoint {}", config.broker.url);

    let (handle, handler_task) = MqttHandler::spawn(
        config.broker.clone(),
        config.display.clone(),
        Arc::new(WsConnector),
    );
    let printer = spawn_event_printer(&handle);

    let mut console = Console::new(handle.clone(), config.catalog());
    println!("{}", HELP);
    run_console(&mut console).await?;

    handle.shutdown();
    handler_task
        .await
        .map_err(|e| eyre!("MQTT handler panicked: {}", e))?;
    printer.abort();
    Ok(())
}

fn setup() -> Result<LogLevelHandle> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info")
    }
    Ok(setup_logging_env())
}

/// Installs the subscriber at `info` so config loading is logged. The
/// configured level is applied through the returned handle.
fn setup_logging_env() -> LogLevelHandle {
    let (filter, handle) = reload::Layer::new(LevelFilter::INFO);
    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_target(false)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true),
        )
        .init();
    handle
}

/// Config path from the first argument, else the default location. A missing
/// default file is created so there is something to edit.
async fn setup_config() -> Result<AppConfig> {
    match std::env::args().nth(1) {
        Some(path) => AppConfig::load_or_default(&PathBuf::from(path)).await,
        None => {
            let path = AppConfig::default_path();
            AppConfig::ensure_default_config(&path).await?;
            AppConfig::load_or_default(&path).await
        }
    }
}

fn spawn_event_printer(handle: &MqttHandle) -> tokio::task::JoinHandle<()> {
    let mut events = handle.events();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => println!("{}", render_event(&event)),
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Event printer lagged, {} events skipped", skipped)
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}

async fn run_console(console: &mut Console) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        let line = tokio::select! {
            line = lines.next_line() => line.map_err(|e| eyre!("Failed to read stdin: {}", e))?,
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                None
            }
        };
        let Some(line) = line else {
            // EOF or Ctrl-C: same as `quit`
            for out in console.execute(Command::Quit).await {
                println!("{}", out);
            }
            return Ok(());
        };
        if line.trim().is_empty() {
            continue;
        }

        match line.parse::<Command>() {
            Ok(command) => {
                let quit = command == Command::Quit;
                for out in console.execute(command).await {
                    println!("{}", out);
                }
                if quit {
                    return Ok(());
                }
            }
            Err(e) => {
                debug!("Rejected input {:?}", line);
                println!("{}", e);
            }
        }
    }
}
