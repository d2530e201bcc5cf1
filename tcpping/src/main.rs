use anyhow::Result;
use clap::{CommandFactory, Parser};
use tcpping::{args::Opts, Catcher, Config, PingError, Pitcher};
use tracing::{error, Level};

#[tokio::main]
async fn main() -> Result<()> {
    let opts = match Opts::try_parse() {
        Ok(opts) => opts,
        Err(e) if !e.use_stderr() => {
            // --help and --version
            e.print()?;
            return Ok(());
        }
        Err(e) => {
            e.print()?;
            print_usage()?;
            return Ok(());
        }
    };

    let level = match opts.verbose {
        0 => Level::INFO,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    };
    tracing_subscriber::fmt().with_max_level(level).init();

    let config = match opts.config_file.clone() {
        Some(path) => Config::from_file(&path),
        None => Config::try_from(opts).map_err(anyhow::Error::from),
    };
    let config = match config {
        Ok(config) => config,
        Err(e) if matches!(e.downcast_ref::<PingError>(), Some(PingError::Configuration(_))) => {
            error!("{}", e);
            print_usage()?;
            return Ok(());
        }
        Err(e) => return Err(e),
    };

    match config {
        Config::Pitcher(cfg) => {
            Pitcher::new(cfg).run().await?;
        }
        Config::Catcher(cfg) => {
            Catcher::bind(&cfg)?.run().await?;
        }
    }
    Ok(())
}

fn print_usage() -> Result<()> {
    Opts::command().print_help()?;
    Ok(())
}
