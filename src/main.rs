use invoicedesk::config::{DeskConfig, CONFIG_PATH_VAR};
use invoicedesk::console::{self, Command};
use invoicedesk::session::SessionEvent;
use invoicedesk::{Desk, DeskError};
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("invoicedesk=info")),
        )
        .init();

    if let Err(e) = run().await {
        tracing::error!("{}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<(), DeskError> {
    let config_path = std::env::var_os(CONFIG_PATH_VAR).map(PathBuf::from);
    let config = DeskConfig::load(config_path.as_deref()).await?;

    let desk = Desk::open(&config).await?;
    let mut events = desk.guard.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                SessionEvent::Authenticated { user_id } => println!("[session] signed in: {}", user_id),
                SessionEvent::LoggedOut { reason } => println!("[session] logged out: {:?}", reason),
                SessionEvent::Notice { message, severity } => println!("[{}] {}", severity, message),
            }
        }
    });

    let state = desk.start().await?;
    tracing::info!("Desk ready ({:?})", state);
    println!("{}", console::HELP);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let command = match line.parse::<Command>() {
            Ok(command) => command,
            Err(e) => {
                println!("{}", e);
                continue;
            }
        };
        let quit = command == Command::Quit;
        // Any command counts as user activity.
        if !matches!(command, Command::Quit | Command::Logout | Command::Login { .. }) {
            desk.guard.record_activity();
        }
        println!("{}", console::execute(&desk, command).await);
        if quit {
            break;
        }
    }

    Ok(())
}
