use std::path::PathBuf;
use clap::{Parser, Subcommand};
use log::{info, warn};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep, sleep_until, Duration, Instant};
use tokio_util::sync::CancellationToken;

use crate::config::io::{get_weight_path, ConfigIO};
use crate::config::types::Config;
use crate::device::btle::BtleTransport;
use crate::device::frame::{decode, encode, format_hex, weight_to_tenths};
use crate::device::session::{spawn_session, SessionHandle, SessionSettings};
use crate::device::transport::event_channel;
use crate::device::types::{ConnectionState, SessionView};
use crate::error::AppRunError;
use crate::store::{record_weights, WeightStore};

#[derive(Parser, Debug)]
#[command(name = "scale-link", version, about = "Read and tare a Decent Scale over bluetooth")]
pub struct Cli {
    /// Config file to use instead of the default location
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Advertised name of the scale
    #[arg(long, global = true)]
    pub device_name: Option<String>,

    /// How long to scan for the scale, in milliseconds
    #[arg(long, global = true)]
    pub scan_timeout: Option<u64>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Connect to the scale and print everything it reports until ctrl-c
    Watch {
        /// Connect to this address instead of scanning
        #[arg(long)]
        address: Option<String>,

        /// Scan for the whole scan window and pick the strongest scale, instead of the first one
        #[arg(long)]
        manual: bool,
    },
    /// Connect, tare the scale and print the weight that follows
    Tare {
        #[arg(long)]
        address: Option<String>,
    },
    /// List the scales in range
    Scan,
    /// Decode a frame, e.g. `decode 03 CE 04 E6 00 00 2F`
    Decode {
        #[arg(required = true)]
        frame: Vec<String>,
    },
    /// Print the frame the scale sends for a weight in grams
    Encode {
        #[arg(allow_negative_numbers = true)]
        weight: f32,

        #[arg(long)]
        unstable: bool,
    },
    /// Print the last weight recorded by `watch` or `tare`
    LastWeight,
    /// Forget the scale remembered from the last connection
    Forget,
}

pub fn parse_hex(input: &str) -> Result<Vec<u8>, AppRunError> {
    let invalid = || AppRunError::InvalidHex { input: input.to_string() };

    let digits: Vec<char> = input
        .chars()
        .filter(|c| !c.is_whitespace() && *c != ':' && *c != ',')
        .collect();
    if digits.is_empty() || digits.len() % 2 != 0 {
        return Err(invalid());
    }

    digits
        .chunks(2)
        .map(|pair| {
            let pair: String = pair.iter().collect();
            u8::from_str_radix(&pair, 16).map_err(|_| invalid())
        })
        .collect()
}

fn open_config(cli: &Cli) -> Result<ConfigIO, AppRunError> {
    Ok(match &cli.config {
        Some(path) => ConfigIO::open(path.clone())?,
        None => ConfigIO::new_sync()?,
    })
}

fn apply_overrides(cli: &Cli, config: &mut Config) {
    if let Some(device_name) = &cli.device_name {
        config.device_name = device_name.clone();
    }
    if let Some(scan_timeout) = cli.scan_timeout {
        config.scan_timeout_ms = scan_timeout;
    }
}

async fn start_session(cancel: CancellationToken, settings: SessionSettings) -> Result<(SessionHandle, JoinHandle<()>), AppRunError> {
    let (events, receiver) = event_channel();
    let transport = BtleTransport::new(events).await?;
    Ok(spawn_session(cancel, transport, receiver, settings))
}

async fn stop_session(session: SessionHandle, task: JoinHandle<()>) {
    session.disconnect();
    session.shutdown();
    if let Err(err) = task.await {
        warn!("Scale session task failed: {:?}", err);
    }
}

const RECONNECT_DELAY: Duration = Duration::from_millis(500);

/// Prints the log lines and state changes of a session view as they appear.
#[derive(Default)]
struct ViewPrinter {
    log_generation: u64,
    printed_lines: usize,
    state: Option<ConnectionState>,
}

impl ViewPrinter {
    fn print(&mut self, view: &SessionView) {
        // the log starts over with every connection attempt
        if view.log_generation != self.log_generation || view.log.len() < self.printed_lines {
            self.log_generation = view.log_generation;
            self.printed_lines = 0;
        }
        for line in &view.log[self.printed_lines..] {
            println!("{}", line);
        }
        self.printed_lines = view.log.len();

        if self.state.as_ref() != Some(&view.state) {
            println!("[{}]", view.state);
            self.state = Some(view.state.clone());
        }
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn wait_for_change(view: &mut watch::Receiver<SessionView>) -> Result<SessionView, AppRunError> {
    view.changed().await.map_err(|_| AppRunError::SessionClosed)?;
    let snapshot = view.borrow_and_update().clone();
    Ok(snapshot)
}

async fn watch_command(config_io: ConfigIO, mut config: Config, address: Option<String>, manual: bool) -> Result<(), AppRunError> {
    let mut locker = config_io.locker()?;
    let _guard = locker.lock()?;
    let store = WeightStore::open(get_weight_path(config_io.path()))?;

    let mut settings = SessionSettings::from(&config);
    settings.auto_connect = !manual;

    let cancel = CancellationToken::new();
    let (session, task) = start_session(cancel.clone(), settings.clone()).await?;
    let recorder = record_weights(cancel.clone(), store, session.subscribe());

    let begin = |session: &SessionHandle| match &address {
        Some(address) => session.connect_to_address(address.clone()),
        None => session.start_scan(),
    };
    begin(&session);

    let mut view = session.subscribe();
    let mut printer = ViewPrinter::default();
    let mut candidate = address.clone();
    let mut previous_state = ConnectionState::Idle;
    // in manual mode the strongest scale is picked once the scan window closes
    let mut pick_at = if manual && address.is_none() { Some(Instant::now() + settings.scan_timeout) } else { None };
    let mut reconnect_at: Option<Instant> = None;

    let result = loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                break signal.map_err(|source| AppRunError::Signal { source });
            },
            _ = wait_until(reconnect_at) => {
                reconnect_at = None;
                begin(&session);
                if manual && address.is_none() {
                    pick_at = Some(Instant::now() + settings.scan_timeout);
                }
            },
            _ = wait_until(pick_at) => {
                pick_at = None;
                if let ConnectionState::DeviceFound { address, .. } = session.state() {
                    session.connect_to_address(address);
                }
            },
            snapshot = wait_for_change(&mut view) => {
                let snapshot = match snapshot {
                    Ok(snapshot) => snapshot,
                    Err(err) => break Err(err),
                };
                printer.print(&snapshot);

                match &snapshot.state {
                    ConnectionState::DeviceFound { address, .. } => candidate = Some(address.clone()),
                    ConnectionState::Connected if previous_state != ConnectionState::Connected => {
                        if let Some(address) = &candidate {
                            if config.save_device(address) {
                                if let Err(err) = config_io.save(&config).await {
                                    warn!("Failed to remember scale {}: {}", address, err);
                                }
                            }
                        }
                    },
                    ConnectionState::Idle if previous_state != ConnectionState::Idle => {
                        // link lost or an error cooled down: try again, like the scale was just switched on
                        info!("Reconnecting...");
                        reconnect_at = Some(Instant::now() + RECONNECT_DELAY);
                    },
                    _ => {},
                }
                previous_state = snapshot.state;
            },
        }
    };

    stop_session(session, task).await;
    if let Err(err) = recorder.await {
        warn!("Weight recorder failed: {:?}", err);
    }
    result
}

async fn tare_command(config_io: ConfigIO, config: Config, address: Option<String>) -> Result<(), AppRunError> {
    let store = WeightStore::open(get_weight_path(config_io.path()))?;

    let cancel = CancellationToken::new();
    let (session, task) = start_session(cancel.clone(), SessionSettings::from(&config)).await?;
    let recorder = record_weights(cancel.clone(), store, session.subscribe());

    match address {
        Some(address) => session.connect_to_address(address),
        None => session.start_scan(),
    }

    let mut view = session.subscribe();
    let mut printer = ViewPrinter::default();
    let mut tare_sent = false;
    let mut tared = false;
    let mut started = false;

    let result = loop {
        let snapshot = match wait_for_change(&mut view).await {
            Ok(snapshot) => snapshot,
            Err(err) => break Err(err),
        };
        printer.print(&snapshot);

        match &snapshot.state {
            ConnectionState::Error { message } => break Err(AppRunError::Session { message: message.clone() }),
            ConnectionState::Idle if started => break Err(AppRunError::Session { message: String::from("Disconnected") }),
            ConnectionState::Idle => continue,
            _ => started = true,
        }

        // the first reading means notifications flow and the write characteristic is known
        if !tare_sent && snapshot.reading.is_some() {
            session.send_tare();
            tare_sent = true;
            continue;
        }

        if tare_sent && !tared && snapshot.log.iter().any(|line| line == "> Tare command sent") {
            tared = true;
            continue;
        }

        if tared {
            if let Some(reading) = snapshot.reading.filter(|reading| reading.weight.abs() < 0.05) {
                println!("Tared: {:.1} g", reading.weight);
                break Ok(());
            }
        }
    };

    stop_session(session, task).await;
    if let Err(err) = recorder.await {
        warn!("Weight recorder failed: {:?}", err);
    }
    result
}

async fn scan_command(config: Config) -> Result<(), AppRunError> {
    let mut settings = SessionSettings::from(&config);
    settings.auto_connect = false;
    settings.preferred_address = None;

    let cancel = CancellationToken::new();
    let (session, task) = start_session(cancel, settings.clone()).await?;
    session.start_scan();

    sleep(settings.scan_timeout).await;

    let devices = session.devices();
    if devices.is_empty() {
        println!("No \"{}\" found", settings.device_name);
    }
    for device in devices {
        let saved = if config.saved_device_address.as_deref() == Some(device.address.as_str()) { " (saved)" } else { "" };
        println!("{}{}", device.display_name(), saved);
    }

    stop_session(session, task).await;
    Ok(())
}

fn decode_command(input: &str) -> Result<(), AppRunError> {
    let bytes = parse_hex(input)?;
    let reading = decode(&bytes)?;

    println!("{}", reading.raw_frame);
    println!("weight: {:.1} g", reading.weight);
    println!("stable: {}", reading.is_stable);
    Ok(())
}

fn encode_command(weight: f32, is_stable: bool) -> Result<(), AppRunError> {
    let tenths = weight_to_tenths(weight).ok_or(AppRunError::WeightOutOfRange { weight })?;
    println!("{}", format_hex(&encode(tenths, is_stable)));
    Ok(())
}

async fn last_weight_command(config_io: ConfigIO) -> Result<(), AppRunError> {
    let store = WeightStore::open(get_weight_path(config_io.path()))?;
    let record = store.latest().await?;

    match record.recorded_at() {
        Some(at) => println!("{:.1} g (recorded {})", record.weight, humantime::format_rfc3339_seconds(at)),
        None => println!("No weight recorded yet"),
    }
    Ok(())
}

pub async fn run(cli: Cli) -> Result<(), AppRunError> {
    match &cli.command {
        Command::Decode { frame } => return decode_command(&frame.join(" ")),
        Command::Encode { weight, unstable } => return encode_command(*weight, !*unstable),
        _ => {},
    }

    let config_io = open_config(&cli)?;
    let mut config = config_io.read().await?;
    apply_overrides(&cli, &mut config);

    match cli.command {
        Command::Watch { address, manual } => watch_command(config_io, config, address, manual).await,
        Command::Tare { address } => tare_command(config_io, config, address).await,
        Command::Scan => scan_command(config).await,
        Command::LastWeight => last_weight_command(config_io).await,
        Command::Forget => {
            config.clear_saved_device();
            config_io.save(&config).await?;
            println!("Forgot the saved scale");
            Ok(())
        },
        Command::Decode { .. } | Command::Encode { .. } => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_spaced_hex() {
        assert_eq!(parse_hex("03 CE 04 E6 00 00 2F").unwrap(), vec![0x03, 0xCE, 0x04, 0xE6, 0x00, 0x00, 0x2F]);
        assert_eq!(parse_hex("03:ca:00:00:00:00:c9").unwrap(), vec![0x03, 0xCA, 0x00, 0x00, 0x00, 0x00, 0xC9]);
        assert_eq!(parse_hex("03CE").unwrap(), vec![0x03, 0xCE]);
    }

    #[test]
    fn rejects_malformed_hex() {
        assert!(matches!(parse_hex("03 C"), Err(AppRunError::InvalidHex { .. })));
        assert!(matches!(parse_hex("zz"), Err(AppRunError::InvalidHex { .. })));
        assert!(matches!(parse_hex(""), Err(AppRunError::InvalidHex { .. })));
    }

    #[test]
    fn negative_weights_parse_as_values() {
        let cli = Cli::try_parse_from(["scale-link", "encode", "-12.3", "--unstable"]).unwrap();
        match cli.command {
            Command::Encode { weight, unstable } => {
                assert_eq!(weight, -12.3);
                assert!(unstable);
            },
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn printer_restarts_after_log_clear() {
        let mut printer = ViewPrinter::default();
        let mut view = SessionView::default();
        view.log = vec![String::from("a"), String::from("b")];
        printer.print(&view);
        assert_eq!(printer.printed_lines, 2);

        view.log = vec![String::from("c")];
        printer.print(&view);
        assert_eq!(printer.printed_lines, 1);
        assert_eq!(printer.state, Some(ConnectionState::Idle));
    }

    #[test]
    fn printer_restarts_when_new_attempt_log_is_already_longer() {
        let mut printer = ViewPrinter::default();
        let mut view = SessionView::default();
        view.log = vec![String::from("a")];
        printer.print(&view);

        view.clear_log();
        view.log = vec![String::from("b"), String::from("c"), String::from("d")];
        printer.print(&view);
        assert_eq!(printer.log_generation, 1);
        assert_eq!(printer.printed_lines, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn unset_deadline_never_fires() {
        let fired = tokio::time::timeout(Duration::from_secs(3600), wait_until(None)).await;
        assert!(fired.is_err());

        let deadline = Instant::now() + RECONNECT_DELAY;
        wait_until(Some(deadline)).await;
        assert!(Instant::now() >= deadline);
    }
}
