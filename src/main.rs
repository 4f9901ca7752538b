//! ClaraVerse companion bridge - CLI entry point

use std::process::ExitCode;

use clap::Parser;
use tracing::error;

use clara_companion::cli::{Cli, Command, DeviceAction, ServiceAction};
use clara_companion::config::Config;
use clara_companion::{Result, account, bridge, commands, service, setup_tracing};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    let config_path = Config::path(cli.config.as_deref());

    let result: Result<()> = match cli.command {
        Command::Login { email } => account::login(&config_path, email).await,
        Command::Start => bridge::Bridge::run(config_path).await,
        Command::Status { json } => commands::status(json).await,
        Command::Add {
            name,
            command,
            args,
        } => commands::add(&config_path, name, command, args).await,
        Command::Remove { name } => commands::remove(&config_path, name).await,
        Command::Toggle { name, state } => commands::toggle(&config_path, name, state).await,
        Command::List => commands::list(&config_path).await,
        Command::Service { action } => match action {
            ServiceAction::Install => service::install(),
            ServiceAction::Uninstall => service::uninstall(),
            ServiceAction::Start => service::start(),
            ServiceAction::Stop => service::stop(),
            ServiceAction::Status => service::status(),
        },
        Command::Devices { action } => match action {
            DeviceAction::List => account::devices_list(&config_path).await,
            DeviceAction::Rename { id, name } => {
                account::devices_rename(&config_path, &id, &name).await
            }
            DeviceAction::Revoke { id } => account::devices_revoke(&config_path, &id).await,
        },
        Command::Logout => account::logout(&config_path).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::from(e.exit_code())
        }
    }
}
