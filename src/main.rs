mod boot;
mod gpio;

use std::{
    path::Path,
    sync::{Arc, Mutex},
    time::Duration,
};

use anyhow::{bail, Context, Result};
use clap::{Arg, ArgMatches, Command};
use serialport::SerialPort;

use bridge485_protocol::{
    config::{load_bus_config, EepromImage},
    daemon::bus_loop::boot_bus_loop,
    runtime::{BridgeCommand, BridgeEvent},
};

/// Parse command line arguments and return ArgMatches.
fn parse_args() -> ArgMatches {
    Command::new("bridge485")
        .about("RS485 master polling bridge daemon")
        .arg(
            Arg::new("device")
                .long("device")
                .short('d')
                .help("Serial device connected to the RS485 transceiver")
                .value_name("PATH")
                .default_value("/dev/ttyS0"),
        )
        .arg(
            Arg::new("config-image")
                .long("config-image")
                .short('c')
                .help("Extension EEPROM image holding the bus configuration")
                .value_name("FILE")
                .required(true),
        )
        .arg(
            Arg::new("rxe-gpio")
                .long("rxe-gpio")
                .help("GPIO line to drive low as the bus receive enable")
                .value_name("N")
                .value_parser(clap::value_parser!(u32)),
        )
        .arg(
            Arg::new("log-file")
                .long("log-file")
                .help("Write detailed logs to the specified file (overrides BRIDGE485_LOG_FILE)")
                .value_name("FILE"),
        )
        .get_matches()
}

fn main() -> Result<()> {
    let matches = parse_args();
    boot::init_logging(matches.get_one::<String>("log-file").map(String::as_str))?;

    let image_path = matches.get_one::<String>("config-image").unwrap();
    let store = EepromImage::from_file(Path::new(image_path))?;
    let config = load_bus_config(&store)?;
    log::info!(
        "Bus configuration: baud {}, parity {:?}, stop bits {:?}, {} slave(s)",
        config.baud_rate,
        config.parity,
        config.stop_bits,
        config.slave_addresses.len()
    );

    let device = matches.get_one::<String>("device").unwrap();
    let port = config
        .apply_builder(serialport::new(device.as_str(), config.baud_rate))
        .timeout(Duration::from_millis(10))
        .open()
        .with_context(|| format!("Failed to open serial device {device}"))?;
    log::info!("Serial interface initialized on {device}");
    let serial: Arc<Mutex<Box<dyn SerialPort + Send + 'static>>> = Arc::new(Mutex::new(port));

    // Held for the lifetime of the engine; released on drop.
    let _rxe = match matches.get_one::<u32>("rxe-gpio") {
        Some(&line) => Some(gpio::ReceiveEnable::acquire(line)?),
        None => None,
    };

    let (cmd_tx, cmd_rx) = flume::unbounded::<BridgeCommand>();
    let (evt_tx, evt_rx) = flume::unbounded::<BridgeEvent>();

    let stop_tx = cmd_tx.clone();
    ctrlc::set_handler(move || {
        let _ = stop_tx.send(BridgeCommand::Stop);
    })
    .context("Failed to install shutdown handler")?;

    let loop_serial = serial.clone();
    let loop_config = config.clone();
    let bus_thread =
        std::thread::spawn(move || boot_bus_loop(loop_serial, &loop_config, cmd_rx, evt_tx));

    // The in-process host surface: inbound packets and recipient updates
    // arrive here for redispatch into the event loop.
    for event in evt_rx.iter() {
        match event {
            BridgeEvent::Inbound(packet) => {
                log::info!("Inbound packet, {} bytes", packet.len());
            }
            BridgeEvent::RecipientDiscovered { uid, address } => {
                log::info!("UID {uid:#010X} answers behind slave {address}");
            }
            BridgeEvent::Error(message) => log::error!("{message}"),
            BridgeEvent::Stopped => break,
        }
    }

    match bus_thread.join() {
        Ok(result) => result?,
        Err(_) => bail!("Bus loop thread panicked"),
    }
    log::info!("Shut down");
    Ok(())
}
