use amqp_row_producer::amqp::{Channel, EventLoop};
use amqp_row_producer::{Error, Producer, ProducerConfig};
use anyhow::Context;
use clap::Parser;
use std::fs::File;
use std::io::{self, BufRead, BufReader, Write};
use std::path::PathBuf;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

#[derive(Parser, Debug)]
#[command(name = "amqp-row-producer")]
#[command(about = "Batch delimited rows into RabbitMQ messages", long_about = None)]
struct Args {
    #[arg(short, long, value_name = "FILE", default_value = "config.toml")]
    config: PathBuf,

    #[arg(short, long, value_name = "FILE", help = "Read rows from FILE instead of stdin")]
    input: Option<PathBuf>,

    #[arg(short, long, help = "Enable JSON output for logs")]
    json_logs: bool,

    #[arg(short, long, help = "Verbose logging")]
    verbose: bool,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging(args.json_logs, args.verbose);

    info!("Starting amqp-row-producer");
    info!("Loading configuration from {:?}", args.config);

    let mut config = match ProducerConfig::from_file(&args.config) {
        Ok(cfg) => {
            info!("Configuration loaded successfully");
            cfg
        }
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            return Err(e.into());
        }
    };

    let delimiter = match config.delimiter {
        Some(c) if c.is_ascii() => c as u8,
        Some(c) => anyhow::bail!("delimiter {:?} is not a single-byte character", c),
        None => {
            config.delimiter = Some('\n');
            b'\n'
        }
    };

    info!(
        host = %config.host,
        port = %config.port,
        exchange = %config.exchange_name(),
        num_queues = config.num_queues,
        bind_by_id = config.bind_by_id,
        transactional = config.transactional,
        rows_per_message = config.rows_per_message,
        "Configuration summary"
    );

    let input: Box<dyn BufRead> = match &args.input {
        Some(path) => Box::new(BufReader::new(
            File::open(path).with_context(|| format!("opening input file {:?}", path))?,
        )),
        None => Box::new(BufReader::new(io::stdin())),
    };

    let mut producer = Producer::connect(config)?;
    let rows = feed_rows(input, &mut producer, delimiter)?;

    if producer.flush_pending() {
        info!("Published trailing partial batch");
    }

    let published = producer.messages_published();
    match producer.shutdown() {
        Ok(()) => info!(rows, messages = published, "All rows published"),
        Err(Error::TransactionCommit { reason }) => {
            warn!(rows, messages = published, "Transaction was not committed: {}", reason)
        }
        Err(e) => warn!(rows, messages = published, "Producer finished with error: {}", e),
    }

    Ok(())
}

/// Splits `input` on `delimiter` and hands each row, delimiter included, to
/// the producer.
fn feed_rows<C: Channel, L: EventLoop>(
    input: impl BufRead,
    producer: &mut Producer<C, L>,
    delimiter: u8,
) -> anyhow::Result<u64> {
    let mut rows = 0u64;

    for row in input.split(delimiter) {
        let mut row = row.context("reading rows")?;
        row.push(delimiter);
        producer.write_all(&row)?;
        producer.end_row();
        rows += 1;
    }

    Ok(rows)
}

fn init_logging(json: bool, verbose: bool) {
    let env_filter = if verbose {
        EnvFilter::new("amqp_row_producer=debug,info")
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("amqp_row_producer=info,warn"))
    };

    let fmt_layer = if json {
        tracing_subscriber::fmt::layer()
            .json()
            .flatten_event(true)
            .with_current_span(false)
            .with_span_list(false)
            .with_writer(io::stderr)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_target(false)
            .with_thread_ids(false)
            .with_thread_names(false)
            .with_writer(io::stderr)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}
