//! Entry point for `lpp-client`.
//!
//! Three modes share one scheduler loop:
//! - `client` runs an LPP session against a SUPL server and reports on a
//!   fixed interval,
//! - `serial-dump` copies a serial device into a file or stdout,
//! - `tcp-relay` serves a serial device or file to any number of TCP clients.
//!
//! `main.rs` owns only process setup; protocol work lives in the library.

use std::cell::{Cell as StdCell, RefCell};
use std::path::PathBuf;
use std::rc::Rc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};

use event_scheduler::file::FileConfig;
use event_scheduler::serial::{BaudRate, SerialConfig};
use event_scheduler::stream::TcpServerConfig;
use event_scheduler::{ReadConfig, Scheduler, StdioConfig, Stream};
use lpp_session::delivery::PeriodicDelivery;
use lpp_session::ephemeris::{Ephemeris, EphemerisEngine, RECORD_LEN};
use lpp_session::message::{EnvelopeCodec, MessageBody};
use lpp_session::session::{Session, SessionConfig};
use lpp_session::supl::{Cell, Identity};

/// LPP-over-SUPL client and serial/TCP plumbing.
#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    /// Log at debug level unless RUST_LOG says otherwise.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    mode: Mode,
}

#[derive(Subcommand)]
enum Mode {
    /// Run an LPP session against a location server.
    Client(ClientArgs),
    /// Copy everything read from a serial device to a file or stdout.
    SerialDump {
        /// Serial device path (e.g. /dev/ttyUSB0).
        #[arg(short, long)]
        device: PathBuf,
        #[arg(short, long, default_value_t = 115_200)]
        baud: u32,
        /// Output file; stdout when omitted.
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Leave the device's termios settings alone.
        #[arg(long)]
        raw: bool,
    },
    /// Serve one input stream to TCP clients.
    TcpRelay(RelayArgs),
}

#[derive(Args)]
struct ClientArgs {
    #[arg(long, default_value = "127.0.0.1")]
    host: String,
    #[arg(long, default_value_t = 5431)]
    port: u16,
    #[arg(long, conflicts_with = "imsi")]
    msisdn: Option<u64>,
    #[arg(long)]
    imsi: Option<u64>,
    #[arg(long, default_value_t = 240)]
    mcc: u16,
    #[arg(long, default_value_t = 1)]
    mnc: u16,
    #[arg(long, default_value_t = 1)]
    tac: u32,
    #[arg(long, default_value_t = 0)]
    cell_id: u64,
    /// Report the cell as NR instead of LTE.
    #[arg(long)]
    nr: bool,
    /// Seconds between reports on the periodic transaction.
    #[arg(long, default_value_t = 1)]
    report_interval: u64,
    /// Keep received ephemerides in this cache file.
    #[arg(long)]
    ephemeris_cache: Option<PathBuf>,
}

#[derive(Args)]
struct RelayArgs {
    /// Read from this serial device.
    #[arg(long, conflicts_with = "file")]
    serial: Option<PathBuf>,
    #[arg(long, default_value_t = 115_200)]
    baud: u32,
    /// Read from this file instead.
    #[arg(long)]
    file: Option<PathBuf>,
    /// Bytes per tick when reading a file; 0 reads as fast as possible.
    #[arg(long, default_value_t = 0)]
    rate: usize,
    /// Tick length in milliseconds for --rate.
    #[arg(long, default_value_t = 100)]
    tick_ms: u64,
    #[arg(long, default_value = "0.0.0.0")]
    listen: String,
    #[arg(long, default_value_t = 0)]
    port: u16,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .init();

    let scheduler = Scheduler::new().context("failed to create scheduler")?;
    match cli.mode {
        Mode::Client(args) => run_client(&scheduler, args),
        Mode::SerialDump {
            device,
            baud,
            output,
            raw,
        } => run_serial_dump(&scheduler, device, baud, output, raw),
        Mode::TcpRelay(args) => run_relay(&scheduler, args),
    }
}

// ---------------------------------------------------------------------------
// client
// ---------------------------------------------------------------------------

fn run_client(scheduler: &Scheduler, args: ClientArgs) -> Result<()> {
    let identity = match (args.msisdn, args.imsi) {
        (Some(msisdn), _) => Identity::Msisdn(msisdn),
        (None, Some(imsi)) => Identity::Imsi(imsi),
        (None, None) => Identity::Unknown,
    };
    let cell = if args.nr {
        Cell::nr(args.mcc, args.mnc, args.tac, args.cell_id)
    } else {
        Cell::lte(args.mcc, args.mnc, args.tac, args.cell_id)
    };

    let engine = Rc::new(RefCell::new(EphemerisEngine::new()));
    if let Some(path) = &args.ephemeris_cache {
        let loaded = engine.borrow_mut().load_or_create_cache(path);
        log::info!("{loaded} cached ephemerides");
    }

    let session = Session::new(SessionConfig::new(identity, cell), EnvelopeCodec);
    let done = Rc::new(StdCell::new(false));
    let delivery: Rc<RefCell<Option<PeriodicDelivery>>> = Rc::new(RefCell::new(None));

    {
        let scheduler = scheduler.clone();
        let engine = Rc::clone(&engine);
        let delivery = Rc::clone(&delivery);
        let interval = Duration::from_secs(args.report_interval.max(1));
        session.on_established(move |session| {
            let handle = match session.create_transaction(false) {
                Ok(handle) => handle,
                Err(e) => {
                    log::error!("cannot open report transaction: {e}");
                    return;
                }
            };
            let engine = Rc::clone(&engine);
            let mut reports = 0u64;
            let periodic = PeriodicDelivery::new(session, handle, interval, move || {
                reports += 1;
                let text = format!("report {reports} ephemerides={}", engine.borrow().len());
                Some(MessageBody::Payload(text.into_bytes()))
            });
            periodic.schedule(&scheduler);
            *delivery.borrow_mut() = Some(periodic);
        });
    }

    {
        let engine = Rc::clone(&engine);
        session.on_message(move |_, handle, message| match message.body {
            Some(MessageBody::Payload(bytes)) if bytes.len() == RECORD_LEN => {
                match Ephemeris::from_bytes(&bytes) {
                    Ok(eph) => {
                        if let Err(e) = engine.borrow_mut().add(eph) {
                            log::warn!("ephemeris for {}: {e}", eph.satellite);
                        }
                    }
                    Err(e) => log::warn!("bad ephemeris on {handle}: {e}"),
                }
            }
            Some(MessageBody::Payload(bytes)) => {
                log::info!("{handle}: {} bytes", bytes.len());
            }
            Some(MessageBody::Abort) => log::warn!("{handle}: aborted by server"),
            None => {}
        });
    }

    session.on_begin_transaction(|_, handle| log::debug!("transaction {handle} opened"));
    session.on_end_transaction(|_, handle| log::debug!("transaction {handle} closed"));
    session.on_server_end_transaction(|session, handle| {
        if let Err(e) = session.delete_transaction(handle) {
            log::warn!("closing {handle}: {e}");
        }
    });
    {
        let done = Rc::clone(&done);
        let delivery = Rc::clone(&delivery);
        session.on_disconnected(move |_| {
            if let Some(periodic) = delivery.borrow_mut().take() {
                periodic.cancel();
            }
            done.set(true);
        });
    }

    session
        .connect(args.host.as_str(), args.port)
        .context("failed to start session")?;
    session
        .schedule(scheduler)
        .context("failed to schedule session")?;

    scheduler
        .execute_while(|| !done.get())
        .context("scheduler failed")?;
    Ok(())
}

// ---------------------------------------------------------------------------
// serial-dump
// ---------------------------------------------------------------------------

fn run_serial_dump(
    scheduler: &Scheduler,
    device: PathBuf,
    baud: u32,
    output: Option<PathBuf>,
    raw: bool,
) -> Result<()> {
    let mut config = SerialConfig::new(&device, BaudRate::from_bps_or_default(baud));
    config.raw = raw;
    let input = Stream::serial("serial", config, ReadConfig::default());

    let sink = match &output {
        Some(path) => {
            let file = Stream::file("output", FileConfig::writer(path), ReadConfig::default());
            file.schedule(scheduler)
                .with_context(|| format!("failed to open {}", path.display()))?;
            file
        }
        None => {
            let config = StdioConfig {
                output_only: true,
                ..StdioConfig::default()
            };
            let stdout = Stream::stdio("stdout", config, ReadConfig::default());
            stdout.schedule(scheduler).context("failed to set up stdout")?;
            stdout
        }
    };

    let output_stream = sink.clone();
    input.on_read(move |_, data| {
        if let Err(e) = sink.write(data) {
            log::warn!("[{}] dropping {} bytes: {e}", sink.id(), data.len());
        }
    });
    run_until_complete(scheduler, &input)
        .with_context(|| format!("failed to read {}", device.display()))?;

    // Whatever the output refused so far is still queued.
    scheduler
        .execute_while(|| output_stream.is_connected() && output_stream.pending_writes() > 0)
        .context("scheduler failed")?;
    output_stream.cancel();
    Ok(())
}

// ---------------------------------------------------------------------------
// tcp-relay
// ---------------------------------------------------------------------------

fn run_relay(scheduler: &Scheduler, args: RelayArgs) -> Result<()> {
    let input = match (&args.serial, &args.file) {
        (Some(device), _) => Stream::serial(
            "serial",
            SerialConfig::new(device, BaudRate::from_bps_or_default(args.baud)),
            ReadConfig::default(),
        ),
        (None, Some(path)) => {
            let mut config = FileConfig::reader(path);
            if args.rate > 0 {
                config = config.rate_limited(args.rate, Duration::from_millis(args.tick_ms));
            }
            Stream::file("file", config, ReadConfig::default())
        }
        (None, None) => bail!("one of --serial or --file is required"),
    };

    let server = Stream::tcp_server(
        "relay",
        TcpServerConfig::inet(args.listen.as_str(), args.port),
        ReadConfig::default(),
    );
    server
        .schedule(scheduler)
        .with_context(|| format!("failed to listen on {}:{}", args.listen, args.port))?;
    if let Some(port) = server.actual_port() {
        log::info!("relaying on {}:{port}", args.listen);
    }

    {
        let server = server.clone();
        input.on_read(move |_, data| {
            if server.client_count() == 0 {
                return;
            }
            if let Err(e) = server.write(data) {
                log::warn!("relay: {e}");
            }
        });
    }
    let result = run_until_complete(scheduler, &input);
    server.cancel();
    result
}

/// Schedule `input` and run until it completes or fails.
fn run_until_complete(scheduler: &Scheduler, input: &Stream) -> Result<()> {
    let finished = Rc::new(StdCell::new(false));
    {
        let finished = Rc::clone(&finished);
        input.on_complete(move |stream| {
            log::info!("{} finished", stream.id());
            finished.set(true);
        });
    }
    {
        let finished = Rc::clone(&finished);
        input.on_error(move |stream, e| {
            log::error!("{}: {e}", stream.id());
            finished.set(true);
        });
    }
    input.schedule(scheduler).context("failed to open input")?;
    scheduler
        .execute_while(|| !finished.get())
        .context("scheduler failed")?;
    Ok(())
}
