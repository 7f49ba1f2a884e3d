//! padlink - Game controllers mirrored over the local network
//!
//! Demo binary running either role with a virtual pad.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use padlink::browser::{BrowserEvent, ControllerBrowser};
use padlink::config::{self, Config};
use padlink::controller::{Controller, ControllerMessage, ControllerOptions, StateChange};
use padlink::discovery::{LoopbackDiscovery, MdnsDiscovery, ServiceDiscovery};
use padlink::protocol::{self, ButtonKind, ButtonState, GamepadLayout, JoystickKind, JoystickState};
use padlink::publisher::{ControllerPublisher, PublisherEvent};

/// padlink - Mirror game controllers across the local network
#[derive(Parser)]
#[command(name = "padlink")]
#[command(author = "Padlink Contributors")]
#[command(version = "0.1.0")]
#[command(about = "Mirror game-controller input across the local network", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Use in-process discovery instead of mDNS
    #[arg(long, global = true)]
    loopback: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Receive controllers and print their input
    Browse {
        /// Name to advertise
        #[arg(short, long)]
        name: Option<String>,
    },

    /// Publish a virtual pad to the first browser found
    Publish {
        /// Name given to the virtual pad
        #[arg(short, long)]
        name: Option<String>,

        /// Layout of the virtual pad
        #[arg(short, long, value_enum, default_value_t = LayoutArg::Regular)]
        layout: LayoutArg,

        /// Milliseconds between input changes
        #[arg(short, long, default_value_t = 500)]
        interval: u64,
    },

    /// Run a browser and a virtual pad inside this process
    Demo {
        /// Layout of the virtual pad
        #[arg(short, long, value_enum, default_value_t = LayoutArg::Regular)]
        layout: LayoutArg,

        /// Milliseconds between input changes
        #[arg(short, long, default_value_t = 500)]
        interval: u64,
    },

    /// Show current configuration
    Config {
        /// Generate sample configuration
        #[arg(long)]
        generate: bool,

        /// Output path for generated config
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Show protocol information
    Info,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
enum LayoutArg {
    Micro,
    Regular,
    Extended,
}

impl From<LayoutArg> for GamepadLayout {
    fn from(layout: LayoutArg) -> Self {
        match layout {
            LayoutArg::Micro => GamepadLayout::Micro,
            LayoutArg::Regular => GamepadLayout::Regular,
            LayoutArg::Extended => GamepadLayout::Extended,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config = if let Some(config_path) = &cli.config {
        Config::load(config_path)?
    } else {
        Config::load_default()?
    };

    // Initialize logging; RUST_LOG takes precedence
    let level = if cli.verbose || config.general.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    match cli.command {
        Commands::Browse { name } => {
            let discovery = discovery_backend(cli.loopback)?;
            run_browser(config, name, discovery).await?;
        }
        Commands::Publish { name, layout, interval } => {
            let discovery = discovery_backend(cli.loopback)?;
            run_publisher(config, name, layout.into(), Duration::from_millis(interval), discovery).await?;
        }
        Commands::Demo { layout, interval } => {
            let discovery: Arc<dyn ServiceDiscovery> = Arc::new(LoopbackDiscovery::new());
            let pad_name = format!("{} pad", config.general.name);
            tokio::try_join!(
                run_browser(config.clone(), None, discovery.clone()),
                run_publisher(
                    config.clone(),
                    Some(pad_name),
                    layout.into(),
                    Duration::from_millis(interval),
                    discovery.clone()
                ),
            )?;
        }
        Commands::Config { generate, output } => {
            if generate {
                let sample = config::generate_sample_config()?;
                if let Some(path) = output {
                    std::fs::write(&path, &sample)?;
                    println!("Configuration written to: {}", path.display());
                } else {
                    println!("{}", sample);
                }
            } else {
                println!("{}", toml::to_string_pretty(&config)?);
            }
        }
        Commands::Info => {
            print_info(&config)?;
        }
    }

    Ok(())
}

fn discovery_backend(loopback: bool) -> anyhow::Result<Arc<dyn ServiceDiscovery>> {
    if loopback {
        Ok(Arc::new(LoopbackDiscovery::new()))
    } else {
        Ok(Arc::new(MdnsDiscovery::new()?))
    }
}

/// Run the receiving role
async fn run_browser(
    config: Config,
    name: Option<String>,
    discovery: Arc<dyn ServiceDiscovery>,
) -> anyhow::Result<()> {
    let name = name.unwrap_or_else(|| config.general.name.clone());
    let (event_tx, mut event_rx) = mpsc::unbounded_channel();

    let mut browser = ControllerBrowser::new(name.clone(), config, discovery, Arc::new(event_tx));
    let ports = browser.start().await?;

    println!("\n========================================");
    println!("  padlink Browser Running");
    println!("========================================");
    println!("  Name: {}", name);
    println!("  Control port: {}", ports.control);
    println!("  Input port: {}", ports.input);
    println!("========================================");
    println!("\nWaiting for controllers...");
    println!("Press Ctrl+C to stop.\n");

    loop {
        tokio::select! {
            Some(event) = event_rx.recv() => {
                match event {
                    BrowserEvent::ControllerConnected { controller, kind } => {
                        let index = controller.index();
                        println!("+ Controller {} connected ({:?})", index, kind);
                        controller.observe(move |change| print_change(index, change));
                    }
                    BrowserEvent::ControllerDisconnected { controller } => {
                        println!("- Controller {} disconnected", controller.index());
                    }
                    BrowserEvent::Error(e) => {
                        tracing::error!("Browser error: {}", e);
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                println!("\nShutting down...");
                break;
            }
        }
    }

    browser.stop().await?;
    Ok(())
}

fn print_change(index: u16, change: &StateChange) {
    match change {
        StateChange::Status { new, .. } => println!("  [{}] status {:?}", index, new),
        StateChange::Layout { new, .. } => println!("  [{}] layout {:?}", index, new),
        StateChange::Name { new, .. } => println!("  [{}] name {:?}", index, new),
        StateChange::Button { button, new: Some(state), .. } => {
            println!("  [{}] {:?} {:.2} pressed={}", index, button, state.value, state.pressed)
        }
        StateChange::Joystick { joystick, new: Some(state), .. } => {
            println!("  [{}] {:?} ({:.2}, {:.2})", index, joystick, state.x_axis, state.y_axis)
        }
        StateChange::Button { .. } | StateChange::Joystick { .. } => {}
    }
}

/// Run the sending role with a virtual pad
async fn run_publisher(
    mut config: Config,
    name: Option<String>,
    layout: GamepadLayout,
    interval: Duration,
    discovery: Arc<dyn ServiceDiscovery>,
) -> anyhow::Result<()> {
    // The demo always links to the first browser it finds
    config.input.auto_connect = true;

    let name = name.unwrap_or_else(|| config.general.name.clone());
    let (event_tx, mut event_rx) = mpsc::unbounded_channel();
    let publisher = ControllerPublisher::new(name.clone(), &config, discovery, Arc::new(event_tx))?;

    let options = ControllerOptions {
        coalesce: config.coalesce_interval(),
    };
    let pad = Controller::with_options(0, layout, options);
    pad.send(ControllerMessage::SetName(Some(name.clone())));
    publisher.add_controller(pad.clone());
    publisher.start().await?;

    println!("Publishing virtual pad '{}' ({:?})", name, layout);
    println!("Press Ctrl+C to stop.\n");

    let mut ticker = tokio::time::interval(interval);
    let mut step: u32 = 0;

    loop {
        tokio::select! {
            Some(event) = event_rx.recv() => {
                match event {
                    PublisherEvent::Discovered(record) => println!("? Found {}", record.name),
                    PublisherEvent::Lost { full_name } => println!("? Lost {}", full_name),
                    PublisherEvent::Connected(record) => println!("+ Connected to {}", record.name),
                    PublisherEvent::Disconnected(record) => println!("- Disconnected from {}", record.name),
                    PublisherEvent::Error(e) => tracing::error!("Publisher error: {}", e),
                }
            }
            _ = ticker.tick() => {
                for message in demo_pattern(step) {
                    pad.send(message);
                }
                step = step.wrapping_add(1);
            }
            _ = tokio::signal::ctrl_c() => {
                println!("\nShutting down...");
                break;
            }
        }
    }

    publisher.stop().await?;
    Ok(())
}

/// Press A on even steps and circle the dpad
fn demo_pattern(step: u32) -> Vec<ControllerMessage> {
    let pressed = step % 2 == 0;
    let button = ButtonState::new(if pressed { 1.0 } else { 0.0 }, pressed);

    let direction = match step % 4 {
        0 => JoystickState::new(0.0, -1.0),
        1 => JoystickState::new(1.0, 0.0),
        2 => JoystickState::new(0.0, 1.0),
        _ => JoystickState::new(-1.0, 0.0),
    };

    vec![
        ControllerMessage::ButtonChanged(ButtonKind::A, button),
        ControllerMessage::JoystickChanged(JoystickKind::Dpad, direction),
    ]
}

/// Print protocol information
fn print_info(config: &Config) -> anyhow::Result<()> {
    println!("padlink Information");
    println!("===================\n");

    println!("Protocol Version: {}", protocol::PROTOCOL_VERSION);
    println!("Service Type: {}", config.service_type()?);
    println!("Grace Period: {:?}", config.grace_period());
    println!("Publish Mode: {:?}", config.input.publish_mode);
    match Config::default_path() {
        Some(path) => println!("Config Path: {}", path.display()),
        None => println!("Config Path: unavailable"),
    }

    println!("\nReliable channels:");
    println!("  {} ControllerConnected", protocol::reliable::CONTROLLER_CONNECTED);
    println!("  {} ControllerDisconnected", protocol::reliable::CONTROLLER_DISCONNECTED);
    println!("  {} ControllerName", protocol::reliable::CONTROLLER_NAME);
    println!("  {} SetLayout", protocol::reliable::CONTROLLER_LAYOUT);

    println!("\nUnreliable channels:");
    println!("  {} GamepadMessage", protocol::unreliable::GAMEPAD);
    println!("  {} JoystickChanged", protocol::unreliable::JOYSTICK);
    println!("  {} ButtonChanged", protocol::unreliable::BUTTON);

    Ok(())
}
