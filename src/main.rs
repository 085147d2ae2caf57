use robot_controller::domain::settings::SettingsService;
use robot_controller::infrastructure::bluetooth::socket::factory_for;
use robot_controller::infrastructure::bluetooth::ConnectionManager;
use robot_controller::infrastructure::logging;
use robot_controller::presentation::console::{print_events, ConsoleHost};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::BufReader;
use tokio::sync::mpsc;
use tracing::info;

/// Overrides the settings file location.
const SETTINGS_ENV: &str = "ROBOT_CONTROLLER_SETTINGS";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings_service = match std::env::var_os(SETTINGS_ENV) {
        Some(path) => SettingsService::load(PathBuf::from(path))?,
        None => SettingsService::new()?,
    };
    let settings = settings_service.get().clone();

    let _logging_guard = logging::init_logger(&settings.log_settings)
        .map_err(|e| eprintln!("Failed to initialize logging: {:#}", e))
        .ok();

    info!(
        settings = %settings_service.path().display(),
        transport = ?settings.transport,
        "Starting Robot Controller"
    );

    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let printer = tokio::spawn(print_events(event_rx));

    let manager = Arc::new(ConnectionManager::new(
        factory_for(&settings),
        Arc::new(settings.clone()),
        event_tx.clone(),
    ));
    manager.refresh_peers(settings.bonded_peers(), std::iter::empty());

    let mut host = ConsoleHost::new(manager.clone(), event_tx);
    let result = host.run(BufReader::new(tokio::io::stdin())).await;

    manager.shutdown().await;
    drop(host);
    drop(manager);
    let _ = printer.await;

    info!("Robot Controller stopped");
    result
}
