//! Line codec for the tank microcontroller.
//!
//! Status lines carry six field groups, a protocol version and a CRC:
//!
//! ```text
//!  A<u32>,<u8>,... B... C... D... E... F<u32>,<u16> <version> <crc>\r\n
//! ```
//!
//! Values are uppercase hex without leading zeros and zero is sent as an
//! empty string. Debug lines are `>` followed by one hex byte, repeated.
//! Host commands are `<` code arg code arg `>` with a decimal argument.
use crate::error::ProtocolError;

/// Protocol revision this host understands.
pub const PROTOCOL_VERSION: u8 = 0x8E;

/// Longest command line the device accepts before resynchronising.
const MAX_COMMAND_LEN: usize = 16;

/// Dallas/Maxim CRC-8 (reflected polynomial 0x8C, initial value 0).
pub fn crc8(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |crc, &b| crc8_add(crc, b))
}

#[inline]
pub fn crc8_add(mut crc: u8, byte: u8) -> u8 {
    crc ^= byte;
    for _ in 0..8 {
        crc = if crc & 1 != 0 { (crc >> 1) ^ 0x8C } else { crc >> 1 };
    }
    crc
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Width {
    U8,
    U16,
    U32,
}

impl Width {
    fn max(self) -> u64 {
        match self {
            Width::U8 => u64::from(u8::MAX),
            Width::U16 => u64::from(u16::MAX),
            Width::U32 => u64::from(u32::MAX),
        }
    }
}

use Width::{U8, U16, U32};

const GROUP_A: &[Width] = &[U32, U8, U8, U32, U32, U32, U32];
const GROUP_TEMP: &[Width] = &[U8, U8, U16, U8, U8];
const GROUP_D: &[Width] = &[
    U8, U8, U16, U16, U16, U16, U8, U8, U16, U8, U8, U8, U8, U8, U8, U32,
];
const GROUP_E: &[Width] = &[U8, U8, U8, U8, U8];
const GROUP_F: &[Width] = &[U32, U16];

const SCHEMA: [(char, &[Width]); 6] = [
    ('A', GROUP_A),
    ('B', GROUP_TEMP),
    ('C', GROUP_TEMP),
    ('D', GROUP_D),
    ('E', GROUP_E),
    ('F', GROUP_F),
];

/// Group A: controller health and clock.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Diagnostics {
    pub uptime_ds: u32,
    pub debug_overflow: u8,
    pub usart_rx_overflow: u8,
    pub main_loop_iterations: u32,
    pub clock_drift_ds: u32,
    pub clock_corrections: u32,
    pub clock_ds_since_midnight: u32,
}

/// Groups B and C: one DS18B20 probe each.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TemperatureSensorState {
    pub crc_errors: u8,
    pub disconnects: u8,
    pub temperature_x16: u16,
    pub update_id: u8,
    pub updated_ago_ds: u8,
}

impl TemperatureSensorState {
    pub fn celsius(&self) -> f64 {
        f64::from(self.temperature_x16) / 16.0
    }
}

/// Group D: CO2 sensor and valve logic.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Co2State {
    pub rx_overflow: u8,
    pub crc_errors: u8,
    pub abc_setups: u16,
    pub raw_concentration: u16,
    pub clamped_concentration: u16,
    pub concentration: u16,
    pub temperature: u8,
    pub s: u8,
    pub u: u16,
    pub update_id: u8,
    pub updated_ago_ds: u8,
    pub valve_open: bool,
    pub calculated_day: bool,
    pub force_off: bool,
    pub required_open: bool,
    pub ds_until_can_turn_on: u32,
}

/// Group E: light relays.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LightState {
    pub day_on: bool,
    pub night_on: bool,
    pub day_forced: bool,
    pub night_forced: bool,
    pub forces: u8,
}

/// Group F: raw pH probe ADC accumulation since the previous frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PhAdcState {
    pub adc_accum: u32,
    pub adc_samples: u16,
}

/// One decoded status line.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TelemetryFrame {
    pub version: u8,
    pub diagnostics: Diagnostics,
    pub aquarium_temperature: TemperatureSensorState,
    pub case_temperature: TemperatureSensorState,
    pub co2: Co2State,
    pub light: LightState,
    pub ph: PhAdcState,
}

impl TelemetryFrame {
    pub fn version_matches(&self) -> bool {
        self.version == PROTOCOL_VERSION
    }
}

/// Anything the device can print on one line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceLine {
    Status(TelemetryFrame),
    Debug(Vec<u8>),
}

fn parse_hex(s: &str) -> Result<u64, ProtocolError> {
    if s.is_empty() {
        return Ok(0);
    }
    if s.len() > 8 || !s.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(ProtocolError::BadHex(s.to_string()));
    }
    u64::from_str_radix(s, 16).map_err(|_| ProtocolError::BadHex(s.to_string()))
}

/// Format a value the way the device does: uppercase hex, zero as empty.
pub fn fmt_hex(v: u64) -> String {
    if v == 0 {
        String::new()
    } else {
        format!("{v:X}")
    }
}

struct Fields<'a> {
    group: char,
    widths: &'a [Width],
    values: Vec<u64>,
    pos: usize,
    strict: bool,
}

impl Fields<'_> {
    fn next(&mut self) -> Result<u64, ProtocolError> {
        let index = self.pos + 1;
        let width = self.widths.get(self.pos).copied().unwrap_or(U32);
        let v = match self.values.get(self.pos) {
            Some(&v) => v,
            None if self.strict => {
                return Err(ProtocolError::MissingField {
                    group: self.group,
                    index,
                });
            }
            None => 0,
        };
        self.pos += 1;
        if v > width.max() {
            return Err(ProtocolError::Overflow {
                group: self.group,
                index,
                value: v,
            });
        }
        Ok(v)
    }

    fn u8(&mut self) -> Result<u8, ProtocolError> {
        self.next().map(|v| v as u8)
    }
    fn u16(&mut self) -> Result<u16, ProtocolError> {
        self.next().map(|v| v as u16)
    }
    fn u32(&mut self) -> Result<u32, ProtocolError> {
        self.next().map(|v| v as u32)
    }
    fn flag(&mut self) -> Result<bool, ProtocolError> {
        self.next().map(|v| v != 0)
    }
}

/// Decode one line with its trailing `\r\n` optional.
///
/// A frame whose version differs from [`PROTOCOL_VERSION`] is still decoded:
/// missing fields read as zero and extra fields are ignored. Frames with the
/// expected version must carry every field.
pub fn decode_line(line: &str) -> Result<DeviceLine, ProtocolError> {
    let line = line.trim_end_matches(['\r', '\n']);
    if line.is_empty() {
        return Err(ProtocolError::Empty);
    }
    if let Some(rest) = line.strip_prefix('>') {
        return decode_debug(rest).map(DeviceLine::Debug);
    }
    if !line.starts_with(' ') {
        return Err(ProtocolError::Malformed(
            "status line must start with a space".into(),
        ));
    }
    // Always present: the line starts with a space.
    let crc_at = line.rfind(' ').unwrap_or(0);
    if crc_at == 0 {
        return Err(ProtocolError::Malformed("missing version and crc".into()));
    }
    let (body, crc_field) = line.split_at(crc_at + 1);
    let received = parse_hex(crc_field)?;
    if received > u64::from(u8::MAX) {
        return Err(ProtocolError::Malformed(format!("crc field {crc_field:?}")));
    }
    let computed = crc8(body.as_bytes());
    if received as u8 != computed {
        return Err(ProtocolError::Crc {
            received: received as u8,
            computed,
        });
    }

    let inner = &body[1..body.len() - 1];
    let mut tokens: Vec<&str> = inner.split(' ').collect();
    let version_token = tokens.pop().unwrap_or_default();
    let version = parse_hex(version_token)?;
    if version > u64::from(u8::MAX) {
        return Err(ProtocolError::Malformed(format!(
            "version field {version_token:?}"
        )));
    }
    let version = version as u8;
    let strict = version == PROTOCOL_VERSION;

    let mut groups: [Option<Vec<u64>>; 6] = Default::default();
    for token in tokens {
        let mut chars = token.chars();
        let Some(id) = chars.next() else {
            return Err(ProtocolError::Malformed("empty group".into()));
        };
        let Some(slot) = SCHEMA.iter().position(|(g, _)| *g == id) else {
            continue;
        };
        let values = chars
            .as_str()
            .split(',')
            .map(parse_hex)
            .collect::<Result<Vec<_>, _>>()?;
        groups[slot] = Some(values);
    }
    if groups.iter().all(Option::is_none) {
        return Err(ProtocolError::Malformed("no field groups".into()));
    }

    let mut take = |slot: usize| -> Result<Fields<'static>, ProtocolError> {
        let (group, widths) = SCHEMA[slot];
        let values = match groups[slot].take() {
            Some(v) => v,
            None if strict => return Err(ProtocolError::MissingGroup(group)),
            None => Vec::new(),
        };
        Ok(Fields {
            group,
            widths,
            values,
            pos: 0,
            strict,
        })
    };

    let mut a = take(0)?;
    let diagnostics = Diagnostics {
        uptime_ds: a.u32()?,
        debug_overflow: a.u8()?,
        usart_rx_overflow: a.u8()?,
        main_loop_iterations: a.u32()?,
        clock_drift_ds: a.u32()?,
        clock_corrections: a.u32()?,
        clock_ds_since_midnight: a.u32()?,
    };
    let aquarium_temperature = temperature(&mut take(1)?)?;
    let case_temperature = temperature(&mut take(2)?)?;
    let mut d = take(3)?;
    let co2 = Co2State {
        rx_overflow: d.u8()?,
        crc_errors: d.u8()?,
        abc_setups: d.u16()?,
        raw_concentration: d.u16()?,
        clamped_concentration: d.u16()?,
        concentration: d.u16()?,
        temperature: d.u8()?,
        s: d.u8()?,
        u: d.u16()?,
        update_id: d.u8()?,
        updated_ago_ds: d.u8()?,
        valve_open: d.flag()?,
        calculated_day: d.flag()?,
        force_off: d.flag()?,
        required_open: d.flag()?,
        ds_until_can_turn_on: d.u32()?,
    };
    let mut e = take(4)?;
    let light = LightState {
        day_on: e.flag()?,
        night_on: e.flag()?,
        day_forced: e.flag()?,
        night_forced: e.flag()?,
        forces: e.u8()?,
    };
    let mut f = take(5)?;
    let ph = PhAdcState {
        adc_accum: f.u32()?,
        adc_samples: f.u16()?,
    };

    Ok(DeviceLine::Status(TelemetryFrame {
        version,
        diagnostics,
        aquarium_temperature,
        case_temperature,
        co2,
        light,
        ph,
    }))
}

fn temperature(f: &mut Fields<'_>) -> Result<TemperatureSensorState, ProtocolError> {
    Ok(TemperatureSensorState {
        crc_errors: f.u8()?,
        disconnects: f.u8()?,
        temperature_x16: f.u16()?,
        update_id: f.u8()?,
        updated_ago_ds: f.u8()?,
    })
}

fn decode_debug(rest: &str) -> Result<Vec<u8>, ProtocolError> {
    rest.split('>')
        .map(|b| {
            let v = parse_hex(b)?;
            u8::try_from(v).map_err(|_| ProtocolError::BadHex(b.to_string()))
        })
        .collect()
}

/// Render a frame exactly as the firmware prints it, including CRC and `\r\n`.
pub fn encode_status(frame: &TelemetryFrame) -> String {
    let d = &frame.diagnostics;
    let c = &frame.co2;
    let l = &frame.light;
    let b = |v: bool| u64::from(v);
    let temp = |t: &TemperatureSensorState| {
        vec![
            u64::from(t.crc_errors),
            u64::from(t.disconnects),
            u64::from(t.temperature_x16),
            u64::from(t.update_id),
            u64::from(t.updated_ago_ds),
        ]
    };
    let groups: [(char, Vec<u64>); 6] = [
        (
            'A',
            vec![
                u64::from(d.uptime_ds),
                u64::from(d.debug_overflow),
                u64::from(d.usart_rx_overflow),
                u64::from(d.main_loop_iterations),
                u64::from(d.clock_drift_ds),
                u64::from(d.clock_corrections),
                u64::from(d.clock_ds_since_midnight),
            ],
        ),
        ('B', temp(&frame.aquarium_temperature)),
        ('C', temp(&frame.case_temperature)),
        (
            'D',
            vec![
                u64::from(c.rx_overflow),
                u64::from(c.crc_errors),
                u64::from(c.abc_setups),
                u64::from(c.raw_concentration),
                u64::from(c.clamped_concentration),
                u64::from(c.concentration),
                u64::from(c.temperature),
                u64::from(c.s),
                u64::from(c.u),
                u64::from(c.update_id),
                u64::from(c.updated_ago_ds),
                b(c.valve_open),
                b(c.calculated_day),
                b(c.force_off),
                b(c.required_open),
                u64::from(c.ds_until_can_turn_on),
            ],
        ),
        (
            'E',
            vec![
                b(l.day_on),
                b(l.night_on),
                b(l.day_forced),
                b(l.night_forced),
                u64::from(l.forces),
            ],
        ),
        (
            'F',
            vec![
                u64::from(frame.ph.adc_accum),
                u64::from(frame.ph.adc_samples),
            ],
        ),
    ];

    let mut body = String::with_capacity(160);
    for (id, values) in &groups {
        body.push(' ');
        body.push(*id);
        let joined: Vec<String> = values.iter().map(|v| fmt_hex(*v)).collect();
        body.push_str(&joined.join(","));
    }
    body.push(' ');
    body.push_str(&fmt_hex(u64::from(frame.version)));
    body.push(' ');
    let crc = crc8(body.as_bytes());
    body.push_str(&fmt_hex(u64::from(crc)));
    body.push_str("\r\n");
    body
}

/// Render a debug line.
pub fn encode_debug(bytes: &[u8]) -> String {
    let mut out = String::new();
    for b in bytes {
        out.push('>');
        out.push_str(&fmt_hex(u64::from(*b)));
    }
    out.push_str("\r\n");
    out
}

/// Light override requested by the host.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LightForce {
    #[default]
    NotForced,
    Day,
    Night,
}

impl LightForce {
    pub fn code(self) -> u8 {
        match self {
            LightForce::NotForced => 0,
            LightForce::Day => 1,
            LightForce::Night => 2,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(LightForce::NotForced),
            1 => Some(LightForce::Day),
            2 => Some(LightForce::Night),
            _ => None,
        }
    }
}

/// One host-to-device command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    ForceCo2Off,
    RequiredCo2Valve(bool),
    Light(LightForce),
    /// Least significant byte of deciseconds since midnight.
    Clock0(u8),
    Clock1(u8),
    /// Most significant byte; the device applies the clock when it arrives.
    Clock2(u8),
}

impl Command {
    pub fn code(&self) -> char {
        match self {
            Command::ForceCo2Off => 'F',
            Command::RequiredCo2Valve(_) => 'G',
            Command::Light(_) => 'L',
            Command::Clock0(_) => 'A',
            Command::Clock1(_) => 'B',
            Command::Clock2(_) => 'C',
        }
    }

    pub fn arg(&self) -> u8 {
        match *self {
            Command::ForceCo2Off => 0,
            Command::RequiredCo2Valve(open) => u8::from(open),
            Command::Light(force) => force.code(),
            Command::Clock0(v) | Command::Clock1(v) | Command::Clock2(v) => v,
        }
    }

    pub fn from_parts(code: u8, arg: u8) -> Option<Self> {
        match code {
            b'F' => Some(Command::ForceCo2Off),
            b'G' => Some(Command::RequiredCo2Valve(arg != 0)),
            b'L' => LightForce::from_code(arg).map(Command::Light),
            b'A' => Some(Command::Clock0(arg)),
            b'B' => Some(Command::Clock1(arg)),
            b'C' => Some(Command::Clock2(arg)),
            _ => None,
        }
    }

    /// `<` code arg code arg `>`; the doubled pair lets the device reject line noise.
    pub fn encode(&self) -> String {
        let (c, a) = (self.code(), self.arg());
        format!("<{c}{a}{c}{a}>")
    }
}

/// Clock sync sequence for `ds` deciseconds since midnight, most significant byte last.
pub fn clock_commands(ds: u32) -> [Command; 3] {
    let [b0, b1, b2, _] = ds.to_le_bytes();
    [
        Command::Clock0(b0),
        Command::Clock1(b1),
        Command::Clock2(b2),
    ]
}

/// Device-side command reader: accumulates bytes and yields complete commands,
/// resynchronising on the next `<` after any grammar violation.
#[derive(Debug, Default)]
pub struct CommandParser {
    buf: Vec<u8>,
}

impl CommandParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, bytes: &[u8]) -> Vec<Command> {
        self.buf.extend_from_slice(bytes);
        let mut out = Vec::new();
        loop {
            let Some(start) = self.buf.iter().position(|&b| b == b'<') else {
                self.buf.clear();
                break;
            };
            self.buf.drain(..start);
            // Restart from a later '<' if one shows up before the closing '>'.
            let close = self.buf.iter().position(|&b| b == b'>');
            let reopen = self.buf.iter().skip(1).position(|&b| b == b'<').map(|p| p + 1);
            match (close, reopen) {
                (_, Some(r)) if close.is_none_or(|c| r < c) => {
                    self.buf.drain(..r);
                }
                (Some(c), _) => {
                    if let Some(cmd) = parse_command(&self.buf[1..c]) {
                        out.push(cmd);
                    }
                    self.buf.drain(..=c);
                }
                (None, _) => {
                    if self.buf.len() > MAX_COMMAND_LEN {
                        self.buf.drain(..1);
                        continue;
                    }
                    break;
                }
            }
        }
        out
    }
}

fn parse_arg(s: &[u8]) -> Option<(u8, &[u8])> {
    let digits = s.iter().take(3).take_while(|b| b.is_ascii_digit()).count();
    if digits == 0 {
        return Some((0, s));
    }
    let mut v: u16 = 0;
    for &d in &s[..digits] {
        v = v * 10 + u16::from(d - b'0');
    }
    let v = u8::try_from(v).ok()?;
    Some((v, &s[digits..]))
}

fn parse_command(inner: &[u8]) -> Option<Command> {
    let (&code, rest) = inner.split_first()?;
    if !code.is_ascii_uppercase() {
        return None;
    }
    let (arg1, rest) = parse_arg(rest)?;
    let (&code2, rest) = rest.split_first()?;
    if code2 != code {
        return None;
    }
    let (arg2, rest) = parse_arg(rest)?;
    if !rest.is_empty() || arg1 != arg2 {
        return None;
    }
    Command::from_parts(code, arg1)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_frame() -> TelemetryFrame {
        TelemetryFrame {
            version: PROTOCOL_VERSION,
            diagnostics: Diagnostics {
                uptime_ds: 0x1234,
                clock_ds_since_midnight: 360_000,
                ..Default::default()
            },
            aquarium_temperature: TemperatureSensorState {
                temperature_x16: 25 * 16,
                update_id: 3,
                updated_ago_ds: 4,
                ..Default::default()
            },
            co2: Co2State {
                valve_open: true,
                ds_until_can_turn_on: 0x10000,
                ..Default::default()
            },
            light: LightState {
                day_on: true,
                ..Default::default()
            },
            ph: PhAdcState {
                adc_accum: 5000,
                adc_samples: 8,
            },
            ..Default::default()
        }
    }

    #[test]
    fn zero_is_an_empty_field() {
        assert_eq!(fmt_hex(0), "");
        assert_eq!(fmt_hex(0xAB), "AB");
        assert_eq!(fmt_hex(0x100), "100");
    }

    #[test]
    fn encoded_frame_decodes_to_itself() {
        let frame = sample_frame();
        let line = encode_status(&frame);
        assert!(line.starts_with(" A1234,,,,,,57E40 B,,190,3,4"));
        assert_eq!(decode_line(&line), Ok(DeviceLine::Status(frame)));
    }

    #[test]
    fn flipped_byte_fails_crc() {
        let line = encode_status(&sample_frame());
        let corrupted = line.replacen("190", "191", 1);
        assert!(matches!(
            decode_line(&corrupted),
            Err(ProtocolError::Crc { .. })
        ));
    }

    #[test]
    fn truncated_frame_is_rejected() {
        let line = encode_status(&sample_frame());
        assert!(decode_line(&line[..40]).is_err());
    }

    #[test]
    fn mismatched_version_is_best_effort() {
        let body = " A5 B,,190 8D ";
        let line = format!("{body}{:X}", crc8(body.as_bytes()));
        let DeviceLine::Status(frame) = decode_line(&line).unwrap() else {
            panic!("expected status line");
        };
        assert_eq!(frame.version, 0x8D);
        assert!(!frame.version_matches());
        assert_eq!(frame.diagnostics.uptime_ds, 5);
        assert_eq!(frame.aquarium_temperature.celsius(), 25.0);
        assert_eq!(frame.ph, PhAdcState::default());
    }

    #[test]
    fn matching_version_requires_every_field() {
        let body = " A5 B,,190 8E ";
        let line = format!("{body}{:X}", crc8(body.as_bytes()));
        assert_eq!(
            decode_line(&line),
            Err(ProtocolError::MissingField {
                group: 'A',
                index: 2
            })
        );
    }

    #[test]
    fn matching_version_requires_every_group() {
        let full = encode_status(&sample_frame());
        let without_f = &full[..full.find(" F").unwrap()];
        let body = format!("{without_f} 8E ");
        let line = format!("{body}{:X}", crc8(body.as_bytes()));
        assert_eq!(decode_line(&line), Err(ProtocolError::MissingGroup('F')));
    }

    #[test]
    fn field_wider_than_its_type_is_rejected() {
        let body = " A1,100 8D ";
        let line = format!("{body}{:X}", crc8(body.as_bytes()));
        assert!(matches!(
            decode_line(&line),
            Err(ProtocolError::Overflow {
                group: 'A',
                index: 2,
                ..
            })
        ));
    }

    #[test]
    fn debug_line_bytes() {
        assert_eq!(
            decode_line(">1F>>A\r\n"),
            Ok(DeviceLine::Debug(vec![0x1F, 0, 0x0A]))
        );
        assert_eq!(encode_debug(&[0x1F, 0, 0x0A]), ">1F>>A\r\n");
    }

    #[test]
    fn commands_encode_with_doubled_code() {
        assert_eq!(Command::RequiredCo2Valve(true).encode(), "<G1G1>");
        assert_eq!(Command::Light(LightForce::Night).encode(), "<L2L2>");
        assert_eq!(Command::ForceCo2Off.encode(), "<F0F0>");
        assert_eq!(
            clock_commands(0x0A_0B_0C),
            [
                Command::Clock0(0x0C),
                Command::Clock1(0x0B),
                Command::Clock2(0x0A)
            ]
        );
    }

    #[test]
    fn parser_resyncs_and_handles_split_input() {
        let mut p = CommandParser::new();
        assert!(p.feed(b"xx<G1G").is_empty());
        assert_eq!(p.feed(b"1><L2L1><FF>"), vec![
            Command::RequiredCo2Valve(true),
            Command::ForceCo2Off
        ]);
        assert_eq!(p.feed(b"<A25<C255C255>"), vec![Command::Clock2(255)]);
        assert!(p.feed(b"<C256C256>").is_empty());
    }
}
