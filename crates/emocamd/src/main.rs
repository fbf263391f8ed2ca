use anyhow::Result;
use emocam_core::HttpClassifier;
use emocam_hw::V4lOpener;
use std::str::FromStr;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

mod config;
mod controller;
mod render;

use config::Config;
use controller::{Controller, ControllerError};

/// Interactive commands read from stdin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Start,
    Stop,
    Refresh,
    Status,
    Help,
    Quit,
}

impl FromStr for Command {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "start" => Ok(Command::Start),
            "stop" => Ok(Command::Stop),
            "refresh" => Ok(Command::Refresh),
            "status" => Ok(Command::Status),
            "help" | "?" => Ok(Command::Help),
            "quit" | "exit" | "q" => Ok(Command::Quit),
            other => Err(format!("unknown command: {other}")),
        }
    }
}

const HELP: &str = "commands: start | stop | refresh | status | help | quit";

async fn start_session(controller: &Controller) {
    match controller.start().await {
        Ok(epoch) => tracing::debug!(epoch, "start accepted"),
        Err(ControllerError::AlreadyActive) => {
            tracing::info!("session already active");
        }
        // Already recorded in the state and rendered.
        Err(e) => tracing::debug!(error = %e, "start failed"),
    }
}

/// Returns `false` when the daemon should exit.
async fn dispatch(controller: &Controller, command: Command) -> bool {
    match command {
        Command::Start => start_session(controller).await,
        Command::Stop => {
            if !controller.stop().await {
                tracing::info!("no session to stop");
            }
        }
        Command::Refresh => {
            controller.check_connectivity().await;
        }
        Command::Status => controller.render().await,
        Command::Help => eprintln!("{HELP}"),
        Command::Quit => return false,
    }
    true
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let config = Config::load()?;
    tracing::info!(
        device = %config.camera_device,
        backend = %config.backend_url,
        interval_ms = config.sample_interval_ms,
        render = ?config.render,
        "emocamd starting"
    );

    let classifier = Arc::new(HttpClassifier::new(
        &config.backend_url,
        config.request_timeout(),
    ));
    let controller = Controller::new(
        Arc::new(V4lOpener),
        classifier,
        config.loop_settings(),
        render::stdout_renderer(config.render),
    );

    controller.render().await;
    controller.check_connectivity().await;

    if config.autostart {
        start_session(&controller).await;
    } else {
        eprintln!("{HELP}");
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            result = &mut shutdown => {
                if let Err(e) = result {
                    tracing::warn!(error = %e, "signal handler failed");
                }
                tracing::info!("interrupted");
                break;
            }
            line = lines.next_line(), if stdin_open => {
                match line? {
                    None => {
                        // Detached from a terminal; keep sampling until signalled.
                        tracing::debug!("stdin closed");
                        stdin_open = false;
                    }
                    Some(line) if line.trim().is_empty() => {}
                    Some(line) => match line.parse::<Command>() {
                        Ok(command) => {
                            if !dispatch(&controller, command).await {
                                break;
                            }
                        }
                        Err(e) => eprintln!("{e}\n{HELP}"),
                    },
                }
            }
        }
    }

    controller.stop().await;
    tracing::info!("emocamd shutting down");
    Ok(())
}
