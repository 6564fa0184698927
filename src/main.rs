use clap::Parser;
use voxpipe::cli::{Cli, Command};
use voxpipe::config::Config;
use voxpipe::protocol::ApiRequest;
use voxpipe::stages::build_chain;
use voxpipe::{api, version_string};

fn init_logging() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();
}

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    init_logging();
    let cli = Cli::parse();

    let config_path = cli.config.clone().unwrap_or_else(Config::default_path);
    let config = Config::load_or_default(&config_path)?.with_env_overrides();

    match cli.command.unwrap_or(Command::Serve {
        host: None,
        port: None,
    }) {
        Command::Serve { host, port } => {
            let mut config = config;
            if let Some(host) = host {
                config.server.host = host;
            }
            if let Some(port) = port {
                config.server.port = port;
            }
            // An invalid chain must fail here, before any traffic.
            let chain = build_chain(&config)?;
            log::info!("voxpipe {}", version_string());
            log::info!("chain: {}", chain.describe());
            api::run(&config, chain).await?;
        }
        Command::Check => {
            let chain = build_chain(&config)?;
            println!("configuration ok: {}", config_path.display());
            println!("chain: {}", chain.describe());
        }
        Command::Schema => {
            println!("{}", serde_json::to_string_pretty(&ApiRequest::schema())?);
        }
    }
    Ok(())
}
