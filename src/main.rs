use led_link::domain::settings::SettingsService;
use led_link::infrastructure::logging;
use led_link::presentation::console::{self, ConsoleCommand, ConsoleListener, Flow};
use led_link::LedControlService;
use std::sync::Arc;
use tracing::{error, info, warn};

#[cfg(unix)]
fn platform_connector(
    settings: &led_link::domain::settings::LinkSettings,
) -> led_link::infrastructure::bluetooth::bluez::BlueZConnector {
    led_link::infrastructure::bluetooth::bluez::BlueZConnector::new(settings)
}

#[cfg(windows)]
fn platform_connector(
    _settings: &led_link::domain::settings::LinkSettings,
) -> led_link::infrastructure::bluetooth::winrt::WinRfcommConnector {
    led_link::infrastructure::bluetooth::winrt::WinRfcommConnector::new()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let mut settings = SettingsService::new()?;

    let _logging_guard = logging::init_logger(&settings.get().log_settings)
        .map_err(|e| eprintln!("Failed to initialize logging: {}", e))
        .ok();

    info!("Starting LED controller ({})", settings.path().display());
    match settings.save_if_missing() {
        Ok(true) => info!("Wrote default settings to {}", settings.path().display()),
        Ok(false) => {}
        Err(e) => warn!("Could not write default settings: {}", e),
    }

    let link_settings = settings.get().link.clone();
    let connector = platform_connector(&link_settings);
    let service = LedControlService::start(link_settings, connector);
    service.add_listener(Arc::new(ConsoleListener));

    println!("{}", console::HELP);
    let mut lines = console::spawn_stdin_reader();

    loop {
        let line = tokio::select! {
            line = lines.recv() => match line {
                Some(line) => line,
                None => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        };

        let command = match ConsoleCommand::parse(&line) {
            Ok(Some(command)) => command,
            Ok(None) => continue,
            Err(e) => {
                println!("{}", e);
                continue;
            }
        };

        match console::execute(&service, &mut settings, command) {
            Ok(Flow::Continue) => {}
            Ok(Flow::Quit) => break,
            Err(e) => error!("Command failed: {}", e),
        }
    }

    info!("Shutting down");
    service.shutdown();
    // Let the service close the link before the runtime goes away
    let mut connection = service.watch_connection();
    let _ = tokio::time::timeout(
        std::time::Duration::from_secs(1),
        connection.wait_for(|state| *state == led_link::ConnectionState::Disconnected),
    )
    .await;
    Ok(())
}
