use std::path::Path;
use std::process;

use clap::{Parser, ValueEnum};
use log::{error, info};

use openwrt_ids_ips::config::settings;
use openwrt_ids_ips::rules::{parser, store::RuleStore};
use openwrt_ids_ips::service::supervisor::ServiceManager;
use openwrt_ids_ips::utils::logging;

#[derive(Parser)]
#[command(name = "openwrt-ids-ips")]
#[command(about = "Host IDS/IPS: live capture, rule matching, alerting and blocking")]
struct Cli {
    #[arg(short, long, help = "Network interface to monitor (e.g. eth0, wlan0)")]
    interface: String,

    #[arg(
        short,
        long,
        default_value = "./rules/config_rules.json",
        help = "Path to the rules file"
    )]
    config: String,

    #[arg(long, help = "HOME_NET CIDR override (default 192.168.1.0/24)")]
    home_net: Option<String>,

    #[arg(value_enum, help = "start, stop or update-rules")]
    command: Command,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Command {
    Start,
    Stop,
    UpdateRules,
}

fn main() {
    let cli = Cli::parse();

    if let Err(e) = logging::init_logging(logging::LOG_FILE) {
        eprintln!("failed to initialize logging: {:#}", e);
        process::exit(1);
    }

    let result = match cli.command {
        Command::Start => run_service(&cli),
        Command::Stop => {
            // No IPC to a running instance; the log file has been truncated.
            info!("stop command received");
            Ok(())
        }
        Command::UpdateRules => update_rules(&cli),
    };

    if let Err(e) = result {
        error!("{:#}", e);
        eprintln!("error: {:#}", e);
        process::exit(1);
    }
}

fn run_service(cli: &Cli) -> anyhow::Result<()> {
    info!(
        "starting service on {} with rules file {}",
        cli.interface, cli.config
    );
    let manager = ServiceManager::new(
        &cli.interface,
        Path::new(&cli.config),
        cli.home_net.as_deref(),
    );
    manager.start()
}

/// Validates the rules file offline: loads the protocol set, parses every
/// rule and reports how many load cleanly.
fn update_rules(cli: &Cli) -> anyhow::Result<()> {
    let protocols = settings::load_protocols(Path::new(settings::PROTOCOLS_CONFIG));
    let mut store = RuleStore::with_protocols(&protocols);
    let loaded = parser::load_rules(Path::new(&cli.config), &mut store)?;
    info!("{} rules loaded from {}", loaded, cli.config);
    println!("{} rules loaded from {}", loaded, cli.config);
    Ok(())
}
