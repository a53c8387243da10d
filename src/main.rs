use log::{error, info};
use std::{io::Write, process::ExitCode};
use tokio_util::sync::CancellationToken;

use checksite::{
    Config, Result,
    broker::kafka::{KafkaConsumer, KafkaProducer},
    consumer::GROUP_ID,
    store::PgStatusStore,
    worker::{ProduceMode, run_consumer, run_producer},
};

const USAGE: &str = "usage: checksite produce [--loop] | checksite consume";

enum Command {
    Produce(ProduceMode),
    Consume,
}

fn parse_args(mut args: impl Iterator<Item = String>) -> std::result::Result<Command, String> {
    let command = args.next().ok_or("not enough arguments")?;
    let rest: Vec<String> = args.collect();
    match (command.as_str(), rest.as_slice()) {
        ("produce", []) => Ok(Command::Produce(ProduceMode::Once)),
        ("produce", [flag]) if flag == "--loop" => Ok(Command::Produce(ProduceMode::Loop)),
        ("consume", []) => Ok(Command::Consume),
        ("produce" | "consume", _) => Err(format!("unexpected arguments: {}", rest.join(" "))),
        _ => Err(format!("invalid command: {command}")),
    }
}

fn init_logging() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format(|buf, record| {
            let level = record.level().as_str();
            writeln!(
                buf,
                "[{} {} {}] {}",
                buf.timestamp_millis(),
                &level[..1],
                record.target(),
                record.args()
            )
        })
        .init();
}

async fn produce(config: &Config, mode: ProduceMode, token: CancellationToken) -> Result<bool> {
    let producer = KafkaProducer::new(config)?;
    run_producer(config, producer, mode, token).await
}

async fn consume(config: &Config, token: CancellationToken) -> Result<()> {
    let mut store = PgStatusStore::connect(config.postgresql_url()?).await?;
    let consumer = KafkaConsumer::new(config, GROUP_ID)?;
    run_consumer(config, consumer, &mut store, token).await
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let command = match parse_args(std::env::args().skip(1)) {
        Ok(command) => command,
        Err(msg) => {
            eprintln!("error: {msg}\n\n{USAGE}");
            return ExitCode::from(2);
        }
    };

    init_logging();

    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    let token = CancellationToken::new();
    let signal_token = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl-C, shutting down");
            signal_token.cancel();
        }
    });

    match command {
        Command::Produce(mode) => match produce(&config, mode, token).await {
            Ok(true) => ExitCode::SUCCESS,
            Ok(false) => ExitCode::FAILURE,
            Err(e) => {
                error!("Producer failed: {e}");
                ExitCode::FAILURE
            }
        },
        Command::Consume => match consume(&config, token).await {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                error!("Consumer failed: {e}");
                ExitCode::FAILURE
            }
        },
    }
}
