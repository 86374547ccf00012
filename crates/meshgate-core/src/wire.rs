//! Wire decoder — structural decoder for the tag + wire-type binary format
//! carried inside MQTT envelopes from the mesh.
//!
//! Every record is a sequence of `(field_number, wire_type, value)` triples.
//! Wire types: 0 varint, 1 fixed64, 2 length-delimited, 3/4 deprecated group
//! markers, 5 fixed32. Unknown field numbers are skipped using the wire type
//! alone; unknown wire types are tolerated by consuming one byte so a single
//! malformed field never sinks the whole record.
//!
//! This module only decodes. The service never originates packets onto the
//! mesh; `encode` functions exist solely to drive round-trip tests.

use thiserror::Error;

/// Per-field length cap — defense in depth. The protocol's real maximum is
/// far smaller (payloads are capped by the LoRa MTU), but a malformed or
/// adversarial length-delimited field must never trigger an unbounded
/// allocation.
pub const MAX_FIELD_LEN: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("input truncated before field could be fully read")]
    Truncated,
    #[error("varint exceeded 10 bytes")]
    Varint,
    #[error("field length {0} exceeds {MAX_FIELD_LEN} byte cap")]
    FieldTooLarge(usize),
    #[error("bytes are not valid UTF-8")]
    Encoding,
    #[error("required field {0} missing")]
    MissingField(&'static str),
}

// ── Low-level cursor ──────────────────────────────────────────────────────────

fn read_varint(buf: &[u8], pos: &mut usize) -> Result<u64, DecodeError> {
    let mut result: u64 = 0;
    for i in 0..10u32 {
        if *pos >= buf.len() {
            return Err(DecodeError::Truncated);
        }
        let byte = buf[*pos];
        *pos += 1;
        result |= ((byte & 0x7f) as u64) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok(result);
        }
    }
    Err(DecodeError::Varint)
}

fn read_fixed32(buf: &[u8], pos: &mut usize) -> Result<[u8; 4], DecodeError> {
    if *pos + 4 > buf.len() {
        return Err(DecodeError::Truncated);
    }
    let mut out = [0u8; 4];
    out.copy_from_slice(&buf[*pos..*pos + 4]);
    *pos += 4;
    Ok(out)
}

fn read_fixed64(buf: &[u8], pos: &mut usize) -> Result<[u8; 8], DecodeError> {
    if *pos + 8 > buf.len() {
        return Err(DecodeError::Truncated);
    }
    let mut out = [0u8; 8];
    out.copy_from_slice(&buf[*pos..*pos + 8]);
    *pos += 8;
    Ok(out)
}

fn read_length_delimited<'a>(buf: &'a [u8], pos: &mut usize) -> Result<&'a [u8], DecodeError> {
    let len = read_varint(buf, pos)? as usize;
    if len > MAX_FIELD_LEN {
        return Err(DecodeError::FieldTooLarge(len));
    }
    if *pos + len > buf.len() {
        return Err(DecodeError::Truncated);
    }
    let out = &buf[*pos..*pos + len];
    *pos += len;
    Ok(out)
}

/// A decoded field value, tagged by the wire type it was actually read with.
/// Decoders match on field number AND expected shape, but accept either a
/// varint or a fixed32 for fields that peers are known to emit both ways
/// (node numbers, packet ids).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldValue<'a> {
    Varint(u64),
    Fixed64([u8; 8]),
    Bytes(&'a [u8]),
    Fixed32([u8; 4]),
}

/// Iterates `(field_number, value)` pairs over a record, skipping anything
/// the caller doesn't consume.
pub struct FieldIter<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> FieldIter<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }
}

impl<'a> Iterator for FieldIter<'a> {
    type Item = Result<(u32, FieldValue<'a>), DecodeError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos >= self.buf.len() {
            return None;
        }
        Some(self.step())
    }
}

impl<'a> FieldIter<'a> {
    fn step(&mut self) -> Result<(u32, FieldValue<'a>), DecodeError> {
        let tag = read_varint(self.buf, &mut self.pos)?;
        let field_number = (tag >> 3) as u32;
        let wire_type = (tag & 0x7) as u8;

        match wire_type {
            0 => Ok((field_number, FieldValue::Varint(read_varint(self.buf, &mut self.pos)?))),
            1 => Ok((field_number, FieldValue::Fixed64(read_fixed64(self.buf, &mut self.pos)?))),
            2 => Ok((field_number, FieldValue::Bytes(read_length_delimited(self.buf, &mut self.pos)?))),
            5 => Ok((field_number, FieldValue::Fixed32(read_fixed32(self.buf, &mut self.pos)?))),
            // Deprecated group markers carry no payload bytes of their own.
            3 | 4 => Ok((field_number, FieldValue::Bytes(&self.buf[self.pos..self.pos]))),
            other => {
                if self.pos >= self.buf.len() {
                    return Err(DecodeError::Truncated);
                }
                self.pos += 1;
                tracing::warn!(wire_type = other, field_number, "tolerating reserved wire type, skipping one byte");
                Ok((field_number, FieldValue::Bytes(&[])))
            }
        }
    }
}

// ── Value conversions ─────────────────────────────────────────────────────────

/// Accepts either a varint or fixed32 encoding of a 32-bit unsigned field —
/// node numbers and packet ids are documented as fixed32 but some peers emit
/// them as varints.
fn as_u32(v: &FieldValue) -> Option<u32> {
    match v {
        FieldValue::Varint(x) => Some(*x as u32),
        FieldValue::Fixed32(b) => Some(u32::from_le_bytes(*b)),
        _ => None,
    }
}

/// Raw two's-complement signed varint (not zig-zag). Negative 32-bit values
/// are sign-extended into 64 bits on the wire; truncating back to i32
/// recovers the original value regardless of how many bytes were used.
fn as_signed_varint32(v: &FieldValue) -> Option<i32> {
    match v {
        FieldValue::Varint(x) => Some(*x as i64 as i32),
        _ => None,
    }
}

fn as_sfixed32(v: &FieldValue) -> Option<i32> {
    match v {
        FieldValue::Fixed32(b) => Some(i32::from_le_bytes(*b)),
        _ => None,
    }
}

fn as_f32(v: &FieldValue) -> Option<f32> {
    match v {
        FieldValue::Fixed32(b) => Some(f32::from_le_bytes(*b)),
        _ => None,
    }
}

fn as_bool(v: &FieldValue) -> Option<bool> {
    match v {
        FieldValue::Varint(x) => Some(*x != 0),
        _ => None,
    }
}

fn as_bytes<'a>(v: &FieldValue<'a>) -> Option<&'a [u8]> {
    match v {
        FieldValue::Bytes(b) => Some(b),
        _ => None,
    }
}

fn as_string(v: &FieldValue) -> Result<Option<String>, DecodeError> {
    match v {
        FieldValue::Bytes(b) => {
            std::str::from_utf8(b).map(|s| Some(s.to_string())).map_err(|_| DecodeError::Encoding)
        }
        _ => Ok(None),
    }
}

/// Push one or more varint-encoded i32s from a field that may be packed
/// (length-delimited, consecutive varints) or unpacked (one field per value).
fn push_packed_or_single_varint(out: &mut Vec<i32>, v: &FieldValue) -> Result<(), DecodeError> {
    match v {
        FieldValue::Varint(x) => {
            out.push(*x as i64 as i32);
            Ok(())
        }
        FieldValue::Bytes(b) => {
            let mut pos = 0;
            while pos < b.len() {
                let val = read_varint(b, &mut pos)?;
                out.push(val as i64 as i32);
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

fn push_packed_or_single_u32(out: &mut Vec<u32>, v: &FieldValue) -> Result<(), DecodeError> {
    match v {
        FieldValue::Varint(x) => {
            out.push(*x as u32);
            Ok(())
        }
        FieldValue::Bytes(b) => {
            let mut pos = 0;
            while pos < b.len() {
                let val = read_varint(b, &mut pos)?;
                out.push(val as u32);
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

// ── Encoding helpers (round-trip tests only) ─────────────────────────────────

fn write_tag(out: &mut Vec<u8>, field_number: u32, wire_type: u8) {
    write_varint(out, ((field_number as u64) << 3) | wire_type as u64);
}

fn write_varint(out: &mut Vec<u8>, mut value: u64) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            break;
        }
        out.push(byte | 0x80);
    }
}

fn write_varint_field(out: &mut Vec<u8>, field_number: u32, value: u64) {
    write_tag(out, field_number, 0);
    write_varint(out, value);
}

fn write_signed_varint_field(out: &mut Vec<u8>, field_number: u32, value: i32) {
    write_varint_field(out, field_number, value as i64 as u64);
}

fn write_fixed32_field(out: &mut Vec<u8>, field_number: u32, value: u32) {
    write_tag(out, field_number, 5);
    out.extend_from_slice(&value.to_le_bytes());
}

fn write_sfixed32_field(out: &mut Vec<u8>, field_number: u32, value: i32) {
    write_tag(out, field_number, 5);
    out.extend_from_slice(&value.to_le_bytes());
}

fn write_f32_field(out: &mut Vec<u8>, field_number: u32, value: f32) {
    write_tag(out, field_number, 5);
    out.extend_from_slice(&value.to_le_bytes());
}

fn write_bytes_field(out: &mut Vec<u8>, field_number: u32, value: &[u8]) {
    write_tag(out, field_number, 2);
    write_varint(out, value.len() as u64);
    out.extend_from_slice(value);
}

fn write_string_field(out: &mut Vec<u8>, field_number: u32, value: &str) {
    write_bytes_field(out, field_number, value.as_bytes());
}

fn write_bool_field(out: &mut Vec<u8>, field_number: u32, value: bool) {
    write_varint_field(out, field_number, value as u64);
}

// ── Data (port + payload) ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Data {
    pub portnum: u32,
    pub payload: Vec<u8>,
    pub want_response: bool,
    pub dest: Option<u32>,
    pub source: Option<u32>,
    pub request_id: Option<u32>,
    pub reply_id: Option<u32>,
    pub emoji: Option<u32>,
}

pub fn decode_data(buf: &[u8]) -> Result<Data, DecodeError> {
    let mut out = Data::default();
    for field in FieldIter::new(buf) {
        let (num, val) = field?;
        match num {
            1 => out.portnum = as_u32(&val).unwrap_or(out.portnum),
            2 => out.payload = as_bytes(&val).unwrap_or(&[]).to_vec(),
            3 => out.want_response = as_bool(&val).unwrap_or(false),
            4 => out.dest = as_u32(&val),
            5 => out.source = as_u32(&val),
            6 => out.request_id = as_u32(&val),
            7 => out.reply_id = as_u32(&val),
            8 => out.emoji = as_u32(&val),
            _ => {}
        }
    }
    Ok(out)
}

pub fn encode_data(data: &Data) -> Vec<u8> {
    let mut out = Vec::new();
    write_varint_field(&mut out, 1, data.portnum as u64);
    write_bytes_field(&mut out, 2, &data.payload);
    if data.want_response {
        write_bool_field(&mut out, 3, true);
    }
    if let Some(v) = data.dest {
        write_fixed32_field(&mut out, 4, v);
    }
    if let Some(v) = data.source {
        write_fixed32_field(&mut out, 5, v);
    }
    if let Some(v) = data.request_id {
        write_fixed32_field(&mut out, 6, v);
    }
    if let Some(v) = data.reply_id {
        write_fixed32_field(&mut out, 7, v);
    }
    if let Some(v) = data.emoji {
        write_varint_field(&mut out, 8, v as u64);
    }
    out
}

// ── MeshPacket ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum PacketBody {
    Decoded(Data),
    Encrypted(Vec<u8>),
    None,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MeshPacket {
    pub from: u32,
    pub to: u32,
    pub channel: u32,
    pub body: PacketBody,
    pub id: u32,
    pub rx_time: u32,
    pub rx_snr: f32,
    pub hop_limit: u32,
    pub want_ack: bool,
    pub priority: u32,
    pub rx_rssi: i32,
    pub via_mqtt: bool,
    pub hop_start: u32,
    pub public_key: Vec<u8>,
    pub pki_encrypted: bool,
}

impl Default for MeshPacket {
    fn default() -> Self {
        Self {
            from: 0,
            to: 0,
            channel: 0,
            body: PacketBody::None,
            id: 0,
            rx_time: 0,
            rx_snr: 0.0,
            hop_limit: 0,
            want_ack: false,
            priority: 0,
            rx_rssi: 0,
            via_mqtt: false,
            hop_start: 0,
            public_key: Vec::new(),
            pki_encrypted: false,
        }
    }
}

pub fn decode_mesh_packet(buf: &[u8]) -> Result<MeshPacket, DecodeError> {
    let mut out = MeshPacket::default();
    for field in FieldIter::new(buf) {
        let (num, val) = field?;
        match num {
            1 => out.from = as_u32(&val).unwrap_or(out.from),
            2 => out.to = as_u32(&val).unwrap_or(out.to),
            3 => out.channel = as_u32(&val).unwrap_or(out.channel),
            4 => {
                let bytes = as_bytes(&val).ok_or(DecodeError::Encoding)?;
                out.body = PacketBody::Decoded(decode_data(bytes)?);
            }
            5 => {
                let bytes = as_bytes(&val).unwrap_or(&[]);
                out.body = PacketBody::Encrypted(bytes.to_vec());
            }
            6 => out.id = as_u32(&val).unwrap_or(out.id),
            7 => out.rx_time = as_u32(&val).unwrap_or(out.rx_time),
            8 => out.rx_snr = as_f32(&val).unwrap_or(out.rx_snr),
            9 => out.hop_limit = as_u32(&val).unwrap_or(out.hop_limit),
            10 => out.want_ack = as_bool(&val).unwrap_or(false),
            11 => out.priority = as_u32(&val).unwrap_or(out.priority),
            12 => out.rx_rssi = as_signed_varint32(&val).unwrap_or(out.rx_rssi),
            13 => out.via_mqtt = as_bool(&val).unwrap_or(false),
            14 => out.hop_start = as_u32(&val).unwrap_or(out.hop_start),
            15 => out.public_key = as_bytes(&val).unwrap_or(&[]).to_vec(),
            16 => out.pki_encrypted = as_bool(&val).unwrap_or(false),
            _ => {}
        }
    }
    Ok(out)
}

pub fn encode_mesh_packet(packet: &MeshPacket) -> Vec<u8> {
    let mut out = Vec::new();
    write_fixed32_field(&mut out, 1, packet.from);
    write_fixed32_field(&mut out, 2, packet.to);
    write_varint_field(&mut out, 3, packet.channel as u64);
    match &packet.body {
        PacketBody::Decoded(data) => write_bytes_field(&mut out, 4, &encode_data(data)),
        PacketBody::Encrypted(bytes) => write_bytes_field(&mut out, 5, bytes),
        PacketBody::None => {}
    }
    write_fixed32_field(&mut out, 6, packet.id);
    write_fixed32_field(&mut out, 7, packet.rx_time);
    write_f32_field(&mut out, 8, packet.rx_snr);
    write_varint_field(&mut out, 9, packet.hop_limit as u64);
    if packet.want_ack {
        write_bool_field(&mut out, 10, true);
    }
    write_varint_field(&mut out, 11, packet.priority as u64);
    write_signed_varint_field(&mut out, 12, packet.rx_rssi);
    if packet.via_mqtt {
        write_bool_field(&mut out, 13, true);
    }
    write_varint_field(&mut out, 14, packet.hop_start as u64);
    if !packet.public_key.is_empty() {
        write_bytes_field(&mut out, 15, &packet.public_key);
    }
    if packet.pki_encrypted {
        write_bool_field(&mut out, 16, true);
    }
    out
}

// ── ServiceEnvelope ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ServiceEnvelope {
    pub packet: Option<MeshPacket>,
    pub channel_id: Option<String>,
    pub gateway_id: Option<String>,
}

pub fn decode_service_envelope(buf: &[u8]) -> Result<ServiceEnvelope, DecodeError> {
    let mut out = ServiceEnvelope::default();
    for field in FieldIter::new(buf) {
        let (num, val) = field?;
        match num {
            1 => {
                let bytes = as_bytes(&val).ok_or(DecodeError::Encoding)?;
                out.packet = Some(decode_mesh_packet(bytes)?);
            }
            2 => out.channel_id = as_string(&val)?,
            3 => out.gateway_id = as_string(&val)?,
            _ => {}
        }
    }
    Ok(out)
}

pub fn encode_service_envelope(env: &ServiceEnvelope) -> Vec<u8> {
    let mut out = Vec::new();
    if let Some(packet) = &env.packet {
        write_bytes_field(&mut out, 1, &encode_mesh_packet(packet));
    }
    if let Some(id) = &env.channel_id {
        write_string_field(&mut out, 2, id);
    }
    if let Some(id) = &env.gateway_id {
        write_string_field(&mut out, 3, id);
    }
    out
}

// ── Position ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Position {
    pub latitude_i: Option<i32>,
    pub longitude_i: Option<i32>,
    pub altitude: Option<i32>,
    pub time: Option<u32>,
    pub precision_bits: Option<u32>,
}

pub fn decode_position(buf: &[u8]) -> Result<Position, DecodeError> {
    let mut out = Position::default();
    for field in FieldIter::new(buf) {
        let (num, val) = field?;
        match num {
            1 => out.latitude_i = as_sfixed32(&val).or_else(|| as_signed_varint32(&val)),
            2 => out.longitude_i = as_sfixed32(&val).or_else(|| as_signed_varint32(&val)),
            3 => out.altitude = as_signed_varint32(&val),
            4 => out.time = as_u32(&val),
            5 => out.precision_bits = as_u32(&val),
            _ => {}
        }
    }
    Ok(out)
}

pub fn encode_position(pos: &Position) -> Vec<u8> {
    let mut out = Vec::new();
    if let Some(v) = pos.latitude_i {
        write_sfixed32_field(&mut out, 1, v);
    }
    if let Some(v) = pos.longitude_i {
        write_sfixed32_field(&mut out, 2, v);
    }
    if let Some(v) = pos.altitude {
        write_signed_varint_field(&mut out, 3, v);
    }
    if let Some(v) = pos.time {
        write_varint_field(&mut out, 4, v as u64);
    }
    if let Some(v) = pos.precision_bits {
        write_varint_field(&mut out, 5, v as u64);
    }
    out
}

// ── User ──────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq)]
pub struct User {
    pub id: Option<String>,
    pub long_name: Option<String>,
    pub short_name: Option<String>,
    pub macaddr: Vec<u8>,
    pub hw_model: u32,
    pub is_licensed: bool,
    pub role: u32,
    pub public_key: Vec<u8>,
}

pub fn decode_user(buf: &[u8]) -> Result<User, DecodeError> {
    let mut out = User::default();
    for field in FieldIter::new(buf) {
        let (num, val) = field?;
        match num {
            1 => out.id = as_string(&val)?,
            2 => out.long_name = as_string(&val)?,
            3 => out.short_name = as_string(&val)?,
            4 => out.macaddr = as_bytes(&val).unwrap_or(&[]).to_vec(),
            5 => out.hw_model = as_u32(&val).unwrap_or(0),
            6 => out.is_licensed = as_bool(&val).unwrap_or(false),
            7 => out.role = as_u32(&val).unwrap_or(0),
            8 => out.public_key = as_bytes(&val).unwrap_or(&[]).to_vec(),
            _ => {}
        }
    }
    Ok(out)
}

pub fn encode_user(user: &User) -> Vec<u8> {
    let mut out = Vec::new();
    if let Some(v) = &user.id {
        write_string_field(&mut out, 1, v);
    }
    if let Some(v) = &user.long_name {
        write_string_field(&mut out, 2, v);
    }
    if let Some(v) = &user.short_name {
        write_string_field(&mut out, 3, v);
    }
    if !user.macaddr.is_empty() {
        write_bytes_field(&mut out, 4, &user.macaddr);
    }
    write_varint_field(&mut out, 5, user.hw_model as u64);
    if user.is_licensed {
        write_bool_field(&mut out, 6, true);
    }
    write_varint_field(&mut out, 7, user.role as u64);
    if !user.public_key.is_empty() {
        write_bytes_field(&mut out, 8, &user.public_key);
    }
    out
}

// ── Telemetry (device metrics only — core scope) ─────────────────────────────

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceMetrics {
    pub battery_level: Option<u32>,
    pub voltage: Option<f32>,
    pub channel_utilization: Option<f32>,
    pub air_util_tx: Option<f32>,
    pub uptime_seconds: Option<u32>,
}

fn decode_device_metrics(buf: &[u8]) -> Result<DeviceMetrics, DecodeError> {
    let mut out = DeviceMetrics::default();
    for field in FieldIter::new(buf) {
        let (num, val) = field?;
        match num {
            1 => out.battery_level = as_u32(&val),
            2 => out.voltage = as_f32(&val),
            3 => out.channel_utilization = as_f32(&val),
            4 => out.air_util_tx = as_f32(&val),
            5 => out.uptime_seconds = as_u32(&val),
            _ => {}
        }
    }
    Ok(out)
}

fn encode_device_metrics(m: &DeviceMetrics) -> Vec<u8> {
    let mut out = Vec::new();
    if let Some(v) = m.battery_level {
        write_varint_field(&mut out, 1, v as u64);
    }
    if let Some(v) = m.voltage {
        write_f32_field(&mut out, 2, v);
    }
    if let Some(v) = m.channel_utilization {
        write_f32_field(&mut out, 3, v);
    }
    if let Some(v) = m.air_util_tx {
        write_f32_field(&mut out, 4, v);
    }
    if let Some(v) = m.uptime_seconds {
        write_varint_field(&mut out, 5, v as u64);
    }
    out
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Telemetry {
    pub time: Option<u32>,
    pub device_metrics: Option<DeviceMetrics>,
}

pub fn decode_telemetry(buf: &[u8]) -> Result<Telemetry, DecodeError> {
    let mut out = Telemetry::default();
    for field in FieldIter::new(buf) {
        let (num, val) = field?;
        match num {
            1 => out.time = as_u32(&val),
            2 => {
                let bytes = as_bytes(&val).ok_or(DecodeError::Encoding)?;
                out.device_metrics = Some(decode_device_metrics(bytes)?);
            }
            _ => {}
        }
    }
    Ok(out)
}

pub fn encode_telemetry(t: &Telemetry) -> Vec<u8> {
    let mut out = Vec::new();
    if let Some(v) = t.time {
        write_varint_field(&mut out, 1, v as u64);
    }
    if let Some(dm) = &t.device_metrics {
        write_bytes_field(&mut out, 2, &encode_device_metrics(dm));
    }
    out
}

// ── MapReport ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MapReport {
    pub long_name: Option<String>,
    pub short_name: Option<String>,
    pub role: u32,
    pub hw_model: u32,
    pub firmware_version: Option<String>,
    pub region: u32,
    pub modem_preset: u32,
    pub has_default_channel: bool,
    pub latitude_i: Option<i32>,
    pub longitude_i: Option<i32>,
    pub altitude: Option<i32>,
    pub position_precision: Option<u32>,
    pub num_online_local_nodes: Option<u32>,
}

pub fn decode_map_report(buf: &[u8]) -> Result<MapReport, DecodeError> {
    let mut out = MapReport::default();
    for field in FieldIter::new(buf) {
        let (num, val) = field?;
        match num {
            1 => out.long_name = as_string(&val)?,
            2 => out.short_name = as_string(&val)?,
            3 => out.role = as_u32(&val).unwrap_or(0),
            4 => out.hw_model = as_u32(&val).unwrap_or(0),
            5 => out.firmware_version = as_string(&val)?,
            6 => out.region = as_u32(&val).unwrap_or(0),
            7 => out.modem_preset = as_u32(&val).unwrap_or(0),
            8 => out.has_default_channel = as_bool(&val).unwrap_or(false),
            9 => out.latitude_i = as_sfixed32(&val).or_else(|| as_signed_varint32(&val)),
            10 => out.longitude_i = as_sfixed32(&val).or_else(|| as_signed_varint32(&val)),
            11 => out.altitude = as_signed_varint32(&val),
            12 => out.position_precision = as_u32(&val),
            13 => out.num_online_local_nodes = as_u32(&val),
            _ => {}
        }
    }
    Ok(out)
}

pub fn encode_map_report(m: &MapReport) -> Vec<u8> {
    let mut out = Vec::new();
    if let Some(v) = &m.long_name {
        write_string_field(&mut out, 1, v);
    }
    if let Some(v) = &m.short_name {
        write_string_field(&mut out, 2, v);
    }
    write_varint_field(&mut out, 3, m.role as u64);
    write_varint_field(&mut out, 4, m.hw_model as u64);
    if let Some(v) = &m.firmware_version {
        write_string_field(&mut out, 5, v);
    }
    write_varint_field(&mut out, 6, m.region as u64);
    write_varint_field(&mut out, 7, m.modem_preset as u64);
    if m.has_default_channel {
        write_bool_field(&mut out, 8, true);
    }
    if let Some(v) = m.latitude_i {
        write_sfixed32_field(&mut out, 9, v);
    }
    if let Some(v) = m.longitude_i {
        write_sfixed32_field(&mut out, 10, v);
    }
    if let Some(v) = m.altitude {
        write_signed_varint_field(&mut out, 11, v);
    }
    if let Some(v) = m.position_precision {
        write_varint_field(&mut out, 12, v as u64);
    }
    if let Some(v) = m.num_online_local_nodes {
        write_varint_field(&mut out, 13, v as u64);
    }
    out
}

// ── RouteDiscovery ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RouteDiscovery {
    pub route: Vec<u32>,
    pub route_back: Vec<u32>,
    pub snr_towards: Vec<i32>,
    pub snr_back: Vec<i32>,
}

pub fn decode_route_discovery(buf: &[u8]) -> Result<RouteDiscovery, DecodeError> {
    let mut out = RouteDiscovery::default();
    for field in FieldIter::new(buf) {
        let (num, val) = field?;
        match num {
            1 => push_packed_or_single_u32(&mut out.route, &val)?,
            2 => push_packed_or_single_u32(&mut out.route_back, &val)?,
            3 => push_packed_or_single_varint(&mut out.snr_towards, &val)?,
            4 => push_packed_or_single_varint(&mut out.snr_back, &val)?,
            _ => {}
        }
    }
    Ok(out)
}

pub fn encode_route_discovery(r: &RouteDiscovery) -> Vec<u8> {
    let mut out = Vec::new();
    for &node in &r.route {
        write_varint_field(&mut out, 1, node as u64);
    }
    for &node in &r.route_back {
        write_varint_field(&mut out, 2, node as u64);
    }
    for &snr in &r.snr_towards {
        write_signed_varint_field(&mut out, 3, snr);
    }
    for &snr in &r.snr_back {
        write_signed_varint_field(&mut out, 4, snr);
    }
    out
}

// ── Tests ─────────────────────────────────────────────────────────────────────
