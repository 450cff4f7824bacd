use color_eyre::{eyre::eyre, Result};
use mqtt_session::config::{default_config_path, Settings};
use mqtt_session::logging;
use mqtt_session::session::{Session, SessionEvent};
use mqtt_session::transport::mqtt::MqttTransport;
use std::path::PathBuf;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let settings = setup().await?;
    let config = settings.connection;

    info!("Starting session for {}", config.url);
    let session = Session::new(config, MqttTransport::new());

    for topic in &session.config().topics {
        session.on_message(topic.clone(), |message| {
            info!("{}", message);
            debug!("{}", message.render());
            Ok(())
        });
    }

    let mut events = session.events();
    let watcher = session.clone();
    let event_log = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(SessionEvent::StateChanged(state)) => {
                    info!("Session state: {}", state);
                    if let Some(error) = watcher.last_error() {
                        warn!("Last transport error: {}", error);
                    }
                }
                Ok(SessionEvent::SubscriptionsChanged) => {
                    info!("Subscribed topics: {:?}", watcher.subscriptions())
                }
                Ok(SessionEvent::HistoryChanged) => {}
                Err(RecvError::Lagged(skipped)) => debug!("Skipped {} session events", skipped),
                Err(RecvError::Closed) => break,
            }
        }
    });

    session.connect();

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| eyre!("Failed to listen for Ctrl-C: {}", e))?;

    info!("Shutting down");
    session.disconnect();
    event_log.abort();
    Ok(())
}

async fn setup() -> Result<Settings> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;

    let path = std::env::args_os()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(default_config_path);
    let settings = Settings::load(&path).await?;

    logging::init(&settings.log_level)?;
    info!("Using settings from {}", path.display());
    Ok(settings)
}
