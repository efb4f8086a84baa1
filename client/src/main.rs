#![deny(warnings)]

use {
    anyhow::{Context, Result},
    greeting_client::Target,
    std::{env, str},
    tracing::log::{self, LevelFilter},
};

fn main() -> Result<()> {
    let mut logger = pretty_env_logger::formatted_builder();
    logger.filter_level(LevelFilter::Warn);
    if let Ok(filters) = env::var("RUST_LOG") {
        logger.parse_filters(&filters);
    }
    logger.init();

    let default = Target::default();
    let mut args = env::args().skip(1);

    let host = args.next().unwrap_or_else(|| default.host().to_owned());
    let port = match args.next() {
        Some(port) => port
            .parse::<u16>()
            .with_context(|| format!("expected a port number, got {port:?}"))?,
        None => default.port(),
    };

    let target = Target::new(host, port)?;

    let connection = greeting_client::connect(&target)?;

    log::debug!("connected to {}", connection.candidate().address);

    let response = greeting_client::exchange(connection)?;

    if !response.is_empty() {
        let response = str::from_utf8(&response).context("response is not valid UTF-8")?;
        println!("{response}");
    }

    Ok(())
}
