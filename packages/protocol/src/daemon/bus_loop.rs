use anyhow::Result;
use flume::{Receiver, Sender};
use std::{
    io::{self, Read, Write},
    sync::{Arc, Mutex},
    time::Duration,
};

use serialport::SerialPort;

use crate::{
    config::BusConfig,
    engine::{BusWriter, HostDispatch, MasterEngine},
    runtime::{BridgeCommand, BridgeEvent},
};

// READ_BUF_SIZE is the temporary buffer for each serial read call, sized for
// driver bursts; the engine's own 1 MiB assembling buffer is independent of
// it. The loop ticks once per millisecond between reads.
const READ_BUF_SIZE: usize = 256;
const LOOP_TICK: Duration = Duration::from_millis(1);

/// Write half of the shared serial port handed to the engine.
pub struct SerialBus {
    port: Arc<Mutex<Box<dyn SerialPort + Send + 'static>>>,
}

impl SerialBus {
    pub fn new(port: Arc<Mutex<Box<dyn SerialPort + Send + 'static>>>) -> Self {
        SerialBus { port }
    }
}

impl BusWriter for SerialBus {
    fn write_frame(&mut self, frame: &[u8]) -> io::Result<usize> {
        match self.port.lock() {
            Ok(mut port) => port.write(frame),
            Err(_) => Err(io::Error::new(io::ErrorKind::Other, "serial port lock poisoned")),
        }
    }
}

/// Host capability backed by the event channel.
pub struct EventHost {
    evt_tx: Sender<BridgeEvent>,
}

impl EventHost {
    pub fn new(evt_tx: Sender<BridgeEvent>) -> Self {
        EventHost { evt_tx }
    }
}

impl HostDispatch for EventHost {
    fn dispatch_response(&mut self, packet: &[u8]) {
        let _ = self
            .evt_tx
            .send(BridgeEvent::Inbound(bytes::Bytes::copy_from_slice(packet)));
    }

    fn add_recipient(&mut self, uid: u32, address: u8) {
        let _ = self
            .evt_tx
            .send(BridgeEvent::RecipientDiscovered { uid, address });
    }
}

/// Boot the bus master I/O loop.
/// Must be started in a separate thread, otherwise it will block the main thread
pub fn boot_bus_loop(
    serial: Arc<Mutex<Box<dyn SerialPort + Send + 'static>>>,
    config: &BusConfig,
    cmd_rx: Receiver<BridgeCommand>,
    evt_tx: Sender<BridgeEvent>,
) -> Result<()> {
    let mut engine = MasterEngine::new(
        config,
        SerialBus::new(serial.clone()),
        EventHost::new(evt_tx.clone()),
    )?;

    log::info!(
        "Polling {} slave(s) as bus master, response timeout {:?}",
        config.slave_addresses.len(),
        config.response_timeout
    );
    engine.start();

    loop {
        while let Ok(cmd) = cmd_rx.try_recv() {
            match cmd {
                BridgeCommand::Dispatch { packet, recipient } => {
                    if let Err(err) = engine.enqueue(&packet, recipient) {
                        evt_tx.send(BridgeEvent::Error(format!("Dispatch rejected: {err}")))?;
                    }
                }
                BridgeCommand::Stop => {
                    evt_tx.send(BridgeEvent::Stopped)?;
                    return Ok(());
                }
            }
        }

        if engine.deadline_due() {
            engine.on_deadline();
        }

        let mut buf = [0u8; READ_BUF_SIZE];
        let received = match serial.lock() {
            Ok(mut port) => match port.read(&mut buf) {
                Ok(n) => n,
                Err(err) if err.kind() == io::ErrorKind::TimedOut => 0,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => 0,
                Err(err) => {
                    evt_tx.send(BridgeEvent::Error(format!("Read error: {err}")))?;
                    0
                }
            },
            Err(_) => 0,
        };
        if received > 0 {
            engine.handle_rx_bytes(&buf[..received]);
        }

        std::thread::sleep(LOOP_TICK);
    }
}
