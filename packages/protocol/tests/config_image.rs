//! Integration tests for decoding the bus configuration image.

use std::time::Duration;

use bridge485_protocol::config::{
    load_bus_config, ConfigStore, EepromImage, Parity, StopBits, CONFIG_LOCATION_ADDRESS,
    CONFIG_LOCATION_BAUDRATE, CONFIG_LOCATION_PARITY, CONFIG_LOCATION_SLAVE_ADDRESSES,
    CONFIG_LOCATION_STOPBITS,
};

fn image(
    own_address: u32,
    baud_rate: u32,
    parity: u8,
    stop_bits: u8,
    slaves: &[u32],
) -> EepromImage {
    let mut data = vec![0u8; 512];
    data[CONFIG_LOCATION_ADDRESS as usize..CONFIG_LOCATION_ADDRESS as usize + 4]
        .copy_from_slice(&own_address.to_le_bytes());
    data[CONFIG_LOCATION_BAUDRATE as usize..CONFIG_LOCATION_BAUDRATE as usize + 4]
        .copy_from_slice(&baud_rate.to_le_bytes());
    data[CONFIG_LOCATION_PARITY as usize] = parity;
    data[CONFIG_LOCATION_STOPBITS as usize] = stop_bits;
    for (i, address) in slaves.iter().enumerate() {
        let at = CONFIG_LOCATION_SLAVE_ADDRESSES as usize + 4 * i;
        data[at..at + 4].copy_from_slice(&address.to_le_bytes());
    }
    EepromImage::from_bytes(data)
}

#[test]
fn test_decode_master_config() {
    let store = image(0, 38_400, 110, 1, &[17, 5, 9]);
    let config = load_bus_config(&store).unwrap();

    assert_eq!(config.baud_rate, 38_400);
    assert_eq!(config.parity, Parity::None);
    assert_eq!(config.stop_bits, StopBits::One);
    assert_eq!(config.slave_addresses, vec![17, 5, 9]);
    assert!(config.response_timeout > Duration::from_millis(8));
}

#[test]
fn test_parity_and_stop_bit_variants() {
    let config = load_bus_config(&image(0, 38_400, 101, 2, &[1])).unwrap();
    assert_eq!(config.parity, Parity::Even);
    assert_eq!(config.stop_bits, StopBits::Two);

    let config = load_bus_config(&image(0, 38_400, 111, 1, &[1])).unwrap();
    assert_eq!(config.parity, Parity::Odd);

    // Anything unrecognized has always decoded as odd.
    let config = load_bus_config(&image(0, 38_400, 42, 1, &[1])).unwrap();
    assert_eq!(config.parity, Parity::Odd);
}

#[test]
fn test_slave_mode_is_rejected() {
    assert!(load_bus_config(&image(7, 38_400, 110, 1, &[1])).is_err());
}

#[test]
fn test_low_baud_rate_is_rejected() {
    assert!(load_bus_config(&image(0, 7, 110, 1, &[1])).is_err());
}

#[test]
fn test_invalid_stop_bits_are_rejected() {
    assert!(load_bus_config(&image(0, 38_400, 110, 3, &[1])).is_err());
}

#[test]
fn test_slave_list_stops_at_first_zero() {
    let store = image(0, 38_400, 110, 1, &[4, 0, 8]);
    let config = load_bus_config(&store).unwrap();
    assert_eq!(config.slave_addresses, vec![4]);
}

#[test]
fn test_slave_list_caps_at_thirty_two() {
    let addresses: Vec<u32> = (1..=40).collect();
    let store = image(0, 38_400, 110, 1, &addresses);
    let config = load_bus_config(&store).unwrap();
    assert_eq!(config.slave_addresses.len(), 32);
    assert_eq!(config.slave_addresses[31], 32);
}

#[test]
fn test_out_of_range_read_is_reported() {
    let store = EepromImage::from_bytes(vec![0u8; 16]);
    let mut buf = [0u8; 4];
    assert!(store.read(400, &mut buf).is_err());
    assert!(load_bus_config(&store).is_err());
}
