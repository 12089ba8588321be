//! A small command-line driver for `agent-client`: connects to a remote agent over SSH, issues a
//! single request, prints the reply as JSON, and disconnects.

use agent_client::{AgentClient, Mode};
use simplelog::{Config as LogConfig, LevelFilter, TermLogger, TerminalMode};
use snafu::ResultExt;
use std::env;
use std::process;
use std::str::FromStr;

type Result<T> = std::result::Result<T, error::Error>;

mod error {
    use snafu::Snafu;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub(crate)))]
    pub(crate) enum Error {
        #[snafu(display("Logger setup error: {}", source))]
        Logger { source: log::SetLoggerError },

        #[snafu(display("{}", source))]
        Client { source: agent_client::Error },
    }
}

/// Stores user-supplied arguments.
struct Args {
    endpoint: String,
    id: Option<String>,
    name: Option<String>,
    mode: Mode,
    verb: String,
    log_level: LevelFilter,
}

fn usage() -> ! {
    let program_name = env::args().next().unwrap_or_else(|| "program".to_string());
    eprintln!(
        r"Usage: {}
            --endpoint USER@HOST
            [ --id ID ]
            [ --name NAME ]
            [ --mode compile|run ]
            [ --verb poll|ping ]
            [ --log-level trace|debug|info|warn|error ]",
        program_name
    );
    process::exit(2);
}

fn usage_msg<S: AsRef<str>>(msg: S) -> ! {
    eprintln!("{}\n", msg.as_ref());
    usage();
}

fn parse_args(args: env::Args) -> Args {
    let mut endpoint = None;
    let mut id = None;
    let mut name = None;
    let mut mode = None;
    let mut verb = None;
    let mut log_level = None;

    let mut iter = args.skip(1);
    while let Some(arg) = iter.next() {
        match arg.as_ref() {
            "--endpoint" => {
                endpoint = Some(
                    iter.next()
                        .unwrap_or_else(|| usage_msg("Did not give argument to --endpoint")),
                )
            }
            "--id" => id = Some(iter.next().unwrap_or_else(|| usage_msg("Did not give argument to --id"))),
            "--name" => {
                name = Some(
                    iter.next()
                        .unwrap_or_else(|| usage_msg("Did not give argument to --name")),
                )
            }
            "--mode" => {
                let mode_str = iter.next().unwrap_or_else(|| usage_msg("Did not give argument to --mode"));
                mode = Some(
                    Mode::from_str(&mode_str)
                        .unwrap_or_else(|e| usage_msg(format!("Invalid mode '{}': {}", mode_str, e))),
                );
            }
            "--verb" => {
                verb = Some(
                    iter.next()
                        .unwrap_or_else(|| usage_msg("Did not give argument to --verb")),
                )
            }
            "--log-level" => {
                let log_level_str = iter
                    .next()
                    .unwrap_or_else(|| usage_msg("Did not give argument to --log-level"));
                log_level = Some(
                    LevelFilter::from_str(&log_level_str)
                        .unwrap_or_else(|_| usage_msg(format!("Invalid log level '{}'", log_level_str))),
                );
            }
            _ => usage(),
        }
    }

    Args {
        endpoint: endpoint.unwrap_or_else(|| usage()),
        id,
        name,
        mode: mode.unwrap_or(Mode::Run),
        verb: verb.unwrap_or_else(|| "poll".to_string()),
        log_level: log_level.unwrap_or(LevelFilter::Info),
    }
}

fn run() -> Result<()> {
    let args = parse_args(env::args());

    TermLogger::init(args.log_level, LogConfig::default(), TerminalMode::Mixed).context(error::LoggerSnafu)?;

    let client = AgentClient::new();
    client
        .init(args.id.as_deref(), args.name.as_deref(), args.mode)
        .context(error::ClientSnafu)?;
    client.connect(&args.endpoint).context(error::ClientSnafu)?;

    let reply = client
        .request(&args.verb, serde_json::json!({}))
        .context(error::ClientSnafu)?;
    println!("{}", reply);

    client.close();
    Ok(())
}

fn main() {
    if let Err(e) = run() {
        eprintln!("{}", e);
        process::exit(1);
    }
}
