//! Bus configuration read from the extension's non-volatile store.
//!
//! The store is a passive collaborator exposing offset reads over a small
//! binary image. Field locations follow the extension's EEPROM layout.

use std::{fs, path::Path, time::Duration};

use anyhow::{bail, Context, Result};

use crate::slave::MAX_SLAVES;

pub const CONFIG_LOCATION_ADDRESS: u16 = 4;
pub const CONFIG_LOCATION_SLAVE_ADDRESSES: u16 = 100;
pub const CONFIG_LOCATION_BAUDRATE: u16 = 400;
pub const CONFIG_LOCATION_PARITY: u16 = 404;
pub const CONFIG_LOCATION_STOPBITS: u16 = 405;

const PARITY_NONE: u8 = 110;
const PARITY_EVEN: u8 = 101;

/// One maximum frame plus a byte of slack, used for the response deadline.
pub const TIMEOUT_BYTES: u32 = 86;

/// Passive configuration store, `read` fills `buf` from `offset`.
pub trait ConfigStore {
    fn read(&self, offset: u16, buf: &mut [u8]) -> Result<()>;
}

/// A configuration image held in memory, typically loaded from a file that
/// mirrors the extension EEPROM.
pub struct EepromImage {
    data: Vec<u8>,
}

impl EepromImage {
    pub fn from_bytes(data: Vec<u8>) -> Self {
        EepromImage { data }
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let data = fs::read(path)
            .with_context(|| format!("Failed to read config image {}", path.display()))?;
        Ok(EepromImage { data })
    }
}

impl ConfigStore for EepromImage {
    fn read(&self, offset: u16, buf: &mut [u8]) -> Result<()> {
        let start = offset as usize;
        let end = start + buf.len();
        if end > self.data.len() {
            bail!("config read of {} bytes at offset {offset} is out of range", buf.len());
        }
        buf.copy_from_slice(&self.data[start..end]);
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Parity {
    None,
    Even,
    Odd,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopBits {
    One,
    Two,
}

impl From<Parity> for serialport::Parity {
    fn from(parity: Parity) -> Self {
        match parity {
            Parity::None => serialport::Parity::None,
            Parity::Even => serialport::Parity::Even,
            Parity::Odd => serialport::Parity::Odd,
        }
    }
}

impl From<StopBits> for serialport::StopBits {
    fn from(stop_bits: StopBits) -> Self {
        match stop_bits {
            StopBits::One => serialport::StopBits::One,
            StopBits::Two => serialport::StopBits::Two,
        }
    }
}

/// Decoded bus configuration.
#[derive(Debug, Clone)]
pub struct BusConfig {
    pub baud_rate: u32,
    pub parity: Parity,
    pub stop_bits: StopBits,
    pub slave_addresses: Vec<u8>,
    pub response_timeout: Duration,
}

impl BusConfig {
    /// Apply line settings to a `serialport` builder.
    pub fn apply_builder(&self, builder: serialport::SerialPortBuilder) -> serialport::SerialPortBuilder {
        builder
            .data_bits(serialport::DataBits::Eight)
            .parity(self.parity.into())
            .stop_bits(self.stop_bits.into())
            .flow_control(serialport::FlowControl::None)
    }
}

fn read_u32(store: &dyn ConfigStore, offset: u16) -> Result<u32> {
    let mut buf = [0u8; 4];
    store.read(offset, &mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_u8(store: &dyn ConfigStore, offset: u16) -> Result<u8> {
    let mut buf = [0u8; 1];
    store.read(offset, &mut buf)?;
    Ok(buf[0])
}

/// Read and validate the complete bus configuration.
///
/// Only master mode is supported: a non-zero own address is rejected.
pub fn load_bus_config(store: &dyn ConfigStore) -> Result<BusConfig> {
    let own_address = read_u32(store, CONFIG_LOCATION_ADDRESS)
        .context("Could not read own address from config store")?;
    if own_address != 0 {
        bail!("Only master mode is supported, configured address is {own_address}");
    }

    let baud_rate = read_u32(store, CONFIG_LOCATION_BAUDRATE)
        .context("Could not read baud rate from config store")?;
    if baud_rate < 8 {
        bail!("Configured bit rate {baud_rate} is too low");
    }

    let parity = match read_u8(store, CONFIG_LOCATION_PARITY)
        .context("Could not read parity from config store")?
    {
        PARITY_NONE => Parity::None,
        PARITY_EVEN => Parity::Even,
        // Anything else has always been treated as odd.
        _ => Parity::Odd,
    };

    let stop_bits = match read_u8(store, CONFIG_LOCATION_STOPBITS)
        .context("Could not read stop bits from config store")?
    {
        1 => StopBits::One,
        2 => StopBits::Two,
        other => bail!("Invalid stop bits value {other} in config store"),
    };

    let mut slave_addresses = Vec::new();
    let mut offset = CONFIG_LOCATION_SLAVE_ADDRESSES;
    loop {
        let address = read_u32(store, offset)
            .context("Could not read slave addresses from config store")?;
        if address == 0 {
            break;
        }
        slave_addresses.push(address as u8);
        if slave_addresses.len() >= MAX_SLAVES {
            break;
        }
        offset += 4;
    }

    Ok(BusConfig {
        baud_rate,
        parity,
        stop_bits,
        slave_addresses,
        response_timeout: response_timeout(baud_rate),
    })
}

/// Deadline for one exchange: time to move a maximum frame in each direction
/// at the configured baud, plus 8 ms of slave turnaround.
pub fn response_timeout(baud_rate: u32) -> Duration {
    let nanos = (TIMEOUT_BYTES as f64 / (baud_rate / 8) as f64) * 1_000_000_000.0 * 2.0
        + 8_000_000.0;
    Duration::from_nanos(nanos as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_response_timeout_floor() {
        // Turnaround slack dominates at high baud rates.
        assert!(response_timeout(1_000_000) >= Duration::from_millis(8));
        // 86 bytes at 38400 baud: about 17.9 ms each way, plus 8 ms.
        let t = response_timeout(38_400);
        assert!(t > Duration::from_millis(43) && t < Duration::from_millis(45), "{t:?}");
    }
}
