use std::{
    collections::VecDeque,
    error::Error,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
        mpsc::{self, RecvTimeoutError},
    },
    time::Duration,
};

use clap::Parser;
use log::{debug, info};
use reqpool::{
    EasyHandle, HandleId, HeaderEntry, HttpEasy, Method, Outcome, Processor, ProcessorConfig,
    ProcessorError,
    cli::{parse_header, preview, request_for},
};

/// How long the submit loop waits for a completion before checking for Ctrl-C.
const TICK: Duration = Duration::from_millis(50);
const PREVIEW_CHARS: usize = 72;

#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// URLs to request, one transaction each
    #[arg(required = true)]
    urls: Vec<String>,
    /// HTTP method: get, post, put or delete
    #[arg(short, long, default_value = "get")]
    method: Method,
    /// Extra request header as 'Name: value'; may be repeated
    #[arg(short = 'H', long = "header", value_parser = parse_header)]
    headers: Vec<HeaderEntry>,
    /// Request body, sent with post and put
    #[arg(short, long)]
    body: Option<String>,
    /// Number of slots in the pool
    #[arg(short, long, default_value_t = 4)]
    slots: usize,
    /// Whole-transfer timeout in seconds
    #[arg(short, long, default_value_t = 60)]
    timeout: u64,
    /// Run each request on the calling thread instead of the processor
    #[arg(long)]
    blocking: bool,
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let cli = Cli::parse();
    let config = ProcessorConfig::default()
        .with_capacity(cli.slots)
        .with_transfer_timeout(Some(Duration::from_secs(cli.timeout)));
    config.validate()?;

    if cli.blocking {
        run_blocking(&cli, &config);
        return Ok(());
    }

    let interrupted = Arc::new(AtomicBool::new(false));
    {
        let interrupted = Arc::clone(&interrupted);
        ctrlc::set_handler(move || interrupted.store(true, Ordering::SeqCst))?;
    }

    let processor = Processor::new(config)?;
    processor.start()?;

    let (tx, rx) = mpsc::channel();
    // a slot's outcomes arrive in submission order
    let mut in_flight: Vec<VecDeque<&str>> = vec![VecDeque::new(); processor.number_of_slots()];
    let mut outstanding = 0;
    let mut urls = cli.urls.iter().enumerate().peekable();

    while urls.peek().is_some() || outstanding > 0 {
        if interrupted.load(Ordering::SeqCst) {
            info!("interrupted, cancelling {outstanding} transactions");
            break;
        }

        if let Some(&(position, url)) = urls.peek() {
            let index = position % processor.number_of_slots();
            let request = request_for(url, &cli.headers, cli.body.as_deref());

            match processor.submit(index, cli.method, &request, tx.clone()) {
                Ok(transaction) => {
                    debug!("{url} submitted on slot {index} as {transaction}");
                    in_flight[index].push_back(url);
                    outstanding += 1;
                    urls.next();
                    continue;
                }
                // wait for the slot's current transaction to finish
                Err(ProcessorError::ObjectBusy(_)) => {}
                Err(e) => {
                    eprintln!("{url}: {e}");
                    urls.next();
                    continue;
                }
            }
        }

        match rx.recv_timeout(TICK) {
            Ok(outcome) => {
                outstanding -= 1;
                let url = in_flight[outcome.slot()].pop_front().unwrap_or("?");
                report(url, &outcome);
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    // stops the worker and cancels anything still queued or in flight
    drop(processor);
    for outcome in rx.try_iter() {
        let url = in_flight[outcome.slot()].pop_front().unwrap_or("?");
        report(url, &outcome);
    }

    Ok(())
}

fn report(url: &str, outcome: &Outcome) {
    match outcome {
        Outcome::Success { status, body, .. } => {
            println!("{url} -> {status} {}", preview(body, PREVIEW_CHARS));
        }
        Outcome::Error { error, .. } => {
            eprintln!("{url} -> error {}: {error}", error.code());
        }
    }
}

fn run_blocking(cli: &Cli, config: &ProcessorConfig) {
    for (position, url) in cli.urls.iter().enumerate() {
        let mut easy =
            HttpEasy::with_limits(HandleId(position as u64 + 1), config.transfer_limits());
        let request = request_for(url, &cli.headers, cli.body.as_deref());

        easy.set_method(cli.method);
        easy.set_url(&request.url);
        easy.set_headers(&request.headers);
        easy.set_body(request.body.as_deref().unwrap_or_default());

        let outcome = match easy.perform() {
            Ok(parts) => Outcome::Success {
                slot: 0,
                transaction: easy.id(),
                status: parts.status,
                headers: parts.headers,
                body: parts.body,
            },
            Err(error) => Outcome::Error {
                slot: 0,
                transaction: easy.id(),
                error,
            },
        };
        report(url, &outcome);
    }
}
