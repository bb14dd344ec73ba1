use crate::DecodeOutcome;

#[cfg(feature = "protocol_serde")]
use serde::{Deserialize, Serialize};

/// GATT service carrying the BMS serial channel.
pub const SERVICE_UUID: u16 = 0xFF00;
/// Characteristic the commands are written to.
pub const WRITE_CHARACTERISTIC_UUID: u16 = 0xFF02;
/// Characteristic the responses are notified on.
pub const NOTIFY_CHARACTERISTIC_UUID: u16 = 0xFF01;

/// start, state, status, length
const HEADER_LENGTH: usize = 4;
/// checksum (2), end
const TRAILER_LENGTH: usize = 3;
/// Fields of the basic info body up to and including the NTC count.
const BASIC_INFO_FIXED_LENGTH: usize = 23;
const STATUS_ERROR: u8 = 0x80;
/// Celsius offset of the NTC readings, in 0.1 K.
const NTC_KELVIN_OFFSET: i32 = 2731;

const REQUEST_HARDWARE_INFO: [u8; 7] = [0xdd, 0xa5, 0x05, 0x00, 0xff, 0xfb, 0x77];
const REQUEST_BASIC_INFO: [u8; 7] = [0xdd, 0xa5, 0x03, 0x00, 0xff, 0xfd, 0x77];
const REQUEST_CELL_VOLTAGES: [u8; 7] = [0xdd, 0xa5, 0x04, 0x00, 0xff, 0xfc, 0x77];

const PREFIX_HARDWARE_INFO: [u8; 2] = [0xdd, 0x05];
const PREFIX_BASIC_INFO: [u8; 2] = [0xdd, 0x03];
const PREFIX_CELL_VOLTAGES: [u8; 2] = [0xdd, 0x04];

/// The three read commands understood by the BMS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    HardwareInfo,
    BasicInfo,
    CellVoltages,
}

impl Command {
    pub const ALL: [Command; 3] = [
        Command::HardwareInfo,
        Command::BasicInfo,
        Command::CellVoltages,
    ];

    /// The outbound byte sequence for this command.
    pub const fn request(self) -> [u8; 7] {
        match self {
            Command::HardwareInfo => REQUEST_HARDWARE_INFO,
            Command::BasicInfo => REQUEST_BASIC_INFO,
            Command::CellVoltages => REQUEST_CELL_VOLTAGES,
        }
    }

    /// The leading two bytes of the matching response.
    pub const fn response_prefix(self) -> [u8; 2] {
        match self {
            Command::HardwareInfo => PREFIX_HARDWARE_INFO,
            Command::BasicInfo => PREFIX_BASIC_INFO,
            Command::CellVoltages => PREFIX_CELL_VOLTAGES,
        }
    }

    pub fn from_response_prefix(prefix: [u8; 2]) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|command| command.response_prefix() == prefix)
    }

    pub const fn name(self) -> &'static str {
        match self {
            Command::HardwareInfo => "hardware info",
            Command::BasicInfo => "basic info",
            Command::CellVoltages => "cell voltages",
        }
    }
}

fn validate_len(what: &'static str, frame: &[u8], required: usize) -> Result<(), DecodeOutcome> {
    if frame.len() < required {
        log::debug!(
            "Invalid {what} frame size - required={} received={}",
            required,
            frame.len()
        );
        return Err(DecodeOutcome::Malformed {
            what,
            detail: format!("required={} received={}", required, frame.len()),
        });
    }
    Ok(())
}

fn be_u16(frame: &[u8], offset: usize) -> u16 {
    u16::from_be_bytes([frame[offset], frame[offset + 1]])
}

fn be_i16(frame: &[u8], offset: usize) -> i16 {
    i16::from_be_bytes([frame[offset], frame[offset + 1]])
}

/// Sum based checksum over status, length and payload: `0x10000 - sum`.
///
/// Returns `None` when the frame is too short to hold its declared payload and checksum.
pub fn frame_checksum(frame: &[u8]) -> Option<(u16, u16)> {
    let length = usize::from(*frame.get(3)?);
    let checksum_offset = HEADER_LENGTH + length;
    if frame.len() < checksum_offset + 2 {
        return None;
    }
    let sum = frame[2..checksum_offset]
        .iter()
        .fold(0u16, |sum, b| sum.wrapping_add(u16::from(*b)));
    Some((0u16.wrapping_sub(sum), be_u16(frame, checksum_offset)))
}

/// Whether the checksum carried by `frame` matches its content.
///
/// Decoding never depends on this; it is only used for diagnostics.
pub fn frame_checksum_matches(frame: &[u8]) -> bool {
    matches!(frame_checksum(frame), Some((calculated, received)) if calculated == received)
}

/// Device identity as reported by the hardware info command.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "protocol_serde", derive(Serialize, Deserialize))]
pub struct HardwareInfo {
    /// Transport level identity (the BLE address), not part of the wire payload.
    pub device_id: String,
    pub name: String,
}

impl HardwareInfo {
    pub fn decode(frame: &[u8], device_id: &str) -> Result<Self, DecodeOutcome> {
        const WHAT: &str = "hardware info";
        validate_len(WHAT, frame, HEADER_LENGTH)?;
        let name_length = usize::from(frame[3]);
        validate_len(WHAT, frame, HEADER_LENGTH + name_length + TRAILER_LENGTH)?;

        let name = &frame[HEADER_LENGTH..HEADER_LENGTH + name_length];
        if !name.is_ascii() {
            return Err(DecodeOutcome::Malformed {
                what: WHAT,
                detail: format!("name is not ASCII: {}", hex::encode(name)),
            });
        }
        Ok(Self {
            device_id: device_id.to_string(),
            name: name.iter().map(|b| char::from(*b)).collect(),
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "protocol_serde", derive(Serialize, Deserialize))]
pub struct BasicInfo {
    pub battery_voltage_v: f32,
    pub current_a: f32, // positive=discharging
    pub remaining_capacity_ah: f32,
    pub nominal_capacity_ah: f32,
    pub cycle_count: u16,
    pub state_of_charge_pct: u8,
    pub cell_count: u8,
    pub ntc_temps_c: Vec<f32>,
}

impl BasicInfo {
    pub fn decode(frame: &[u8]) -> Result<Self, DecodeOutcome> {
        const WHAT: &str = "basic info";
        validate_len(WHAT, frame, HEADER_LENGTH + BASIC_INFO_FIXED_LENGTH)?;
        let body = HEADER_LENGTH;
        let n_ntc = usize::from(frame[body + 22]);
        validate_len(
            WHAT,
            frame,
            HEADER_LENGTH + BASIC_INFO_FIXED_LENGTH + n_ntc * 2 + TRAILER_LENGTH,
        )?;

        // Production date, balance status, protection status, software
        // version and FET status are skipped.
        let ntc_temps_c = (0..n_ntc)
            .map(|i| {
                let raw = be_u16(frame, body + BASIC_INFO_FIXED_LENGTH + i * 2);
                (i32::from(raw) - NTC_KELVIN_OFFSET) as f32 / 10.0
            })
            .collect();

        Ok(Self {
            battery_voltage_v: be_u16(frame, body) as f32 / 100.0,
            current_a: be_i16(frame, body + 2) as f32 / 100.0,
            remaining_capacity_ah: be_u16(frame, body + 4) as f32 / 100.0,
            nominal_capacity_ah: be_u16(frame, body + 6) as f32 / 100.0,
            cycle_count: be_u16(frame, body + 8),
            state_of_charge_pct: frame[body + 19],
            cell_count: frame[body + 21],
            ntc_temps_c,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "protocol_serde", derive(Serialize, Deserialize))]
pub struct CellVoltages {
    pub cell_voltages_v: Vec<f32>,
}

impl CellVoltages {
    pub fn decode(frame: &[u8]) -> Result<Self, DecodeOutcome> {
        const WHAT: &str = "cell voltages";
        validate_len(WHAT, frame, HEADER_LENGTH)?;
        let n_cells = usize::from(frame[3]) / 2;
        validate_len(WHAT, frame, HEADER_LENGTH + n_cells * 2 + TRAILER_LENGTH)?;

        let cell_voltages_v = (0..n_cells)
            .map(|i| {
                let mv = be_i16(frame, HEADER_LENGTH + i * 2);
                log::trace!("cell #{} mV={}", i + 1, mv);
                mv as f32 / 1000.0
            })
            .collect();
        Ok(Self { cell_voltages_v })
    }
}

/// A decoded response.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "protocol_serde", derive(Serialize, Deserialize))]
pub enum Event {
    HardwareInfo(HardwareInfo),
    BasicInfo(BasicInfo),
    CellVoltages(CellVoltages),
}

/// Classify `frame` by its response prefix and decode the matching layout.
///
/// `device_id` is only used for the hardware info shape, whose payload carries no identity.
/// The checksum is never verified here.
pub fn decode(frame: &[u8], device_id: &str) -> Result<Event, DecodeOutcome> {
    if frame.is_empty() {
        return Err(DecodeOutcome::Empty);
    }
    let prefix = [frame[0], frame.get(1).copied().unwrap_or_default()];
    let Some(command) = Command::from_response_prefix(prefix) else {
        return Err(DecodeOutcome::UnknownPrefix(prefix));
    };
    if frame.len() > 2 && frame[2] == STATUS_ERROR {
        log::debug!("Device '{device_id}' reported an error status for {}", command.name());
    }
    match command {
        Command::HardwareInfo => HardwareInfo::decode(frame, device_id).map(Event::HardwareInfo),
        Command::BasicInfo => BasicInfo::decode(frame).map(Event::BasicInfo),
        Command::CellVoltages => CellVoltages::decode(frame).map(Event::CellVoltages),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Build a well formed response with a valid checksum.
    fn response(command: Command, payload: &[u8]) -> Vec<u8> {
        let prefix = command.response_prefix();
        let mut frame = vec![prefix[0], prefix[1], 0x00, payload.len() as u8];
        frame.extend_from_slice(payload);
        let sum = frame[2..]
            .iter()
            .fold(0u16, |sum, b| sum.wrapping_add(u16::from(*b)));
        frame.extend_from_slice(&0u16.wrapping_sub(sum).to_be_bytes());
        frame.push(0x77);
        frame
    }

    fn basic_info_payload(ntc_raw: &[u16]) -> Vec<u8> {
        let mut payload = Vec::new();
        payload.extend_from_slice(&1254u16.to_be_bytes());
        payload.extend_from_slice(&(-50i16).to_be_bytes());
        payload.extend_from_slice(&4200u16.to_be_bytes());
        payload.extend_from_slice(&5000u16.to_be_bytes());
        payload.extend_from_slice(&12u16.to_be_bytes());
        payload.extend_from_slice(&0x2a61u16.to_be_bytes()); // production date
        payload.extend_from_slice(&[0, 0, 0, 0]); // balance status
        payload.extend_from_slice(&0u16.to_be_bytes()); // protection status
        payload.push(0x10); // software version
        payload.push(87);
        payload.push(0x03); // FET status
        payload.push(4);
        payload.push(ntc_raw.len() as u8);
        for raw in ntc_raw {
            payload.extend_from_slice(&raw.to_be_bytes());
        }
        payload
    }

    fn cell_voltages_payload(cells_mv: &[i16]) -> Vec<u8> {
        cells_mv.iter().flat_map(|mv| mv.to_be_bytes()).collect()
    }

    #[test]
    fn decode_basic_info() {
        let frame = response(Command::BasicInfo, &basic_info_payload(&[2757]));
        let event = decode(&frame, "AA:BB:CC:DD:EE:FF").unwrap();
        assert_eq!(
            event,
            Event::BasicInfo(BasicInfo {
                battery_voltage_v: 12.54,
                current_a: -0.5,
                remaining_capacity_ah: 42.0,
                nominal_capacity_ah: 50.0,
                cycle_count: 12,
                state_of_charge_pct: 87,
                cell_count: 4,
                ntc_temps_c: vec![2.6],
            })
        );
    }

    #[test]
    fn decode_basic_info_ntc_conversion() {
        let raw = [2991u16, 2731, 2631];
        let frame = response(Command::BasicInfo, &basic_info_payload(&raw));
        let Event::BasicInfo(info) = decode(&frame, "dev").unwrap() else {
            panic!("expected basic info");
        };
        assert_eq!(info.ntc_temps_c, vec![26.0, 0.0, -10.0]);
        for (i, raw) in raw.iter().enumerate() {
            assert_eq!(info.ntc_temps_c[i], (*raw as i32 - 2731) as f32 / 10.0);
        }
    }

    #[test]
    fn decode_cell_voltages() {
        let frame = response(
            Command::CellVoltages,
            &cell_voltages_payload(&[3300, 3298, 3301, 3299]),
        );
        let event = decode(&frame, "dev").unwrap();
        assert_eq!(
            event,
            Event::CellVoltages(CellVoltages {
                cell_voltages_v: vec![3.300, 3.298, 3.301, 3.299]
            })
        );
    }

    #[test]
    fn decode_cell_voltages_count_follows_length() {
        let cells: Vec<i16> = (0..16).map(|i| 3200 + i).collect();
        let frame = response(Command::CellVoltages, &cell_voltages_payload(&cells));
        let Event::CellVoltages(voltages) = decode(&frame, "dev").unwrap() else {
            panic!("expected cell voltages");
        };
        assert_eq!(voltages.cell_voltages_v.len(), 16);
        for (v, mv) in voltages.cell_voltages_v.iter().zip(&cells) {
            assert_eq!(*v, *mv as f32 / 1000.0);
        }
    }

    #[test]
    fn decode_hardware_info_injects_device_id() {
        let frame = response(Command::HardwareInfo, b"SP04S034L4S200A");
        assert_eq!(
            decode(&frame, "A4:C1:37:00:11:22").unwrap(),
            Event::HardwareInfo(HardwareInfo {
                device_id: "A4:C1:37:00:11:22".to_string(),
                name: "SP04S034L4S200A".to_string(),
            })
        );
    }

    #[test]
    fn decode_hardware_info_rejects_non_ascii_name() {
        let frame = response(Command::HardwareInfo, &[0x41, 0xc3, 0xa9]);
        assert!(matches!(
            decode(&frame, "dev"),
            Err(DecodeOutcome::Malformed { what: "hardware info", .. })
        ));
    }

    #[test]
    fn decode_empty() {
        assert_eq!(decode(&[], "dev"), Err(DecodeOutcome::Empty));
    }

    #[test]
    fn decode_unknown_prefix() {
        assert_eq!(
            decode(&[0xdd, 0x09, 0x00, 0x00, 0xff, 0xf7, 0x77], "dev"),
            Err(DecodeOutcome::UnknownPrefix([0xdd, 0x09]))
        );
        assert_eq!(
            decode(&[0x42], "dev"),
            Err(DecodeOutcome::UnknownPrefix([0x42, 0x00]))
        );
    }

    #[test]
    fn decode_truncated_ntc_array() {
        let mut frame = response(Command::BasicInfo, &basic_info_payload(&[2991, 2991]));
        // Claim three sensors while only two readings are present.
        frame[HEADER_LENGTH + 22] = 3;
        frame.truncate(frame.len() - TRAILER_LENGTH);
        assert!(matches!(
            decode(&frame, "dev"),
            Err(DecodeOutcome::Malformed { what: "basic info", .. })
        ));
    }

    #[test]
    fn decode_truncated_cell_array() {
        let mut frame = response(Command::CellVoltages, &cell_voltages_payload(&[3300, 3301]));
        frame[3] = 200;
        assert!(matches!(
            decode(&frame, "dev"),
            Err(DecodeOutcome::Malformed { what: "cell voltages", .. })
        ));
    }

    #[test]
    fn decode_every_prefix_of_a_frame_never_panics() {
        let frame = response(Command::BasicInfo, &basic_info_payload(&[2991, 2991]));
        for end in 0..frame.len() - TRAILER_LENGTH {
            assert!(decode(&frame[..end], "dev").is_err(), "prefix of {end} bytes");
        }
    }

    #[test]
    fn decode_is_idempotent() {
        let frame = response(Command::BasicInfo, &basic_info_payload(&[2800]));
        assert_eq!(decode(&frame, "dev"), decode(&frame, "dev"));
    }

    #[test]
    fn decode_ignores_checksum() {
        let mut frame = response(Command::CellVoltages, &cell_voltages_payload(&[3300]));
        let checksum_offset = frame.len() - TRAILER_LENGTH;
        frame[checksum_offset] ^= 0xff;
        assert!(!frame_checksum_matches(&frame));
        assert!(decode(&frame, "dev").is_ok());
    }

    #[test]
    fn request_checksums_are_valid() {
        for command in Command::ALL {
            let request = command.request();
            assert!(frame_checksum_matches(&request), "{}", command.name());
            assert_eq!(request[2], command.response_prefix()[1]);
        }
    }

    #[test]
    fn response_checksum_known_value() {
        // Cell voltages response for a single 3300 mV cell.
        let frame = [0xdd, 0x04, 0x00, 0x02, 0x0c, 0xe4, 0xff, 0x0e, 0x77];
        assert_eq!(frame_checksum(&frame), Some((0xff0e, 0xff0e)));
        assert_eq!(frame_checksum(&frame[..5]), None);
    }
}
