//! Wire records posted to the output queue.
//!
//! Every record is framed as one tag byte followed by its fields in native
//! byte order. Extents carry a variable-length photon array; when ancillary
//! records accompany an extent the group is wrapped in a container record so
//! consumers can descend into it.

use crate::io::ElementType;
use anyhow::{bail, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};

pub const KIND_EXTENT: u8 = 0x01;
pub const KIND_ANCILLARY: u8 = 0x02;
pub const KIND_EXCEPTION: u8 = 0x03;
pub const KIND_CONTAINER: u8 = 0x04;

/// Fixed text capacity of an exception record.
pub const EXCEPTION_TEXT_LEN: usize = 256;

/// One photon inside an extent record.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PhotonRecord {
    pub time_ns: i64,
    pub latitude: f64,
    pub longitude: f64,
    /// Along-track distance, centered on the extent mid-point (meters).
    pub x_atc: f32,
    pub y_atc: f32,
    pub height: f32,
    pub relief: f32,
    pub landcover: u8,
    pub snowcover: u8,
    pub atl08_class: u8,
    pub atl03_cnf: i8,
    pub quality_ph: i8,
    pub yapc_score: u8,
}

impl PhotonRecord {
    pub const ENCODED_LEN: usize = 8 + 8 + 8 + 4 * 4 + 6;

    fn put(&self, buf: &mut BytesMut) {
        buf.put_i64_ne(self.time_ns);
        buf.put_f64_ne(self.latitude);
        buf.put_f64_ne(self.longitude);
        buf.put_f32_ne(self.x_atc);
        buf.put_f32_ne(self.y_atc);
        buf.put_f32_ne(self.height);
        buf.put_f32_ne(self.relief);
        buf.put_u8(self.landcover);
        buf.put_u8(self.snowcover);
        buf.put_u8(self.atl08_class);
        buf.put_i8(self.atl03_cnf);
        buf.put_i8(self.quality_ph);
        buf.put_u8(self.yapc_score);
    }

    fn get(buf: &mut &[u8]) -> Self {
        Self {
            time_ns: buf.get_i64_ne(),
            latitude: buf.get_f64_ne(),
            longitude: buf.get_f64_ne(),
            x_atc: buf.get_f32_ne(),
            y_atc: buf.get_f32_ne(),
            height: buf.get_f32_ne(),
            relief: buf.get_f32_ne(),
            landcover: buf.get_u8(),
            snowcover: buf.get_u8(),
            atl08_class: buf.get_u8(),
            atl03_cnf: buf.get_i8(),
            quality_ph: buf.get_i8(),
            yapc_score: buf.get_u8(),
        }
    }
}

/// One along-track extent with its surviving photons.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ExtentRecord {
    pub track: u8,
    pub pair: u8,
    pub sc_orient: u8,
    pub valid: bool,
    pub rgt: u16,
    pub cycle: u16,
    /// Closest ATL06 segment id represented by the extent.
    pub segment_id: u32,
    /// Meters from the equator at mid-extent.
    pub segment_dist: f64,
    /// Extent length in meters.
    pub extent_length: f64,
    /// Interpolated background rate, counts per second.
    pub background_rate: f64,
    pub solar_elevation: f32,
    /// Magnitude of the spacecraft velocity vector, m/s.
    pub spacecraft_velocity: f32,
    pub extent_id: u64,
    pub photons: Vec<PhotonRecord>,
}

impl ExtentRecord {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(
            1 + 4 + 4 + 4 + 4 + 24 + 8 + 8 + self.photons.len() * PhotonRecord::ENCODED_LEN,
        );
        buf.put_u8(KIND_EXTENT);
        buf.put_u8(self.track);
        buf.put_u8(self.pair);
        buf.put_u8(self.sc_orient);
        buf.put_u8(self.valid as u8);
        buf.put_u16_ne(self.rgt);
        buf.put_u16_ne(self.cycle);
        buf.put_u32_ne(self.segment_id);
        buf.put_f64_ne(self.segment_dist);
        buf.put_f64_ne(self.extent_length);
        buf.put_f64_ne(self.background_rate);
        buf.put_f32_ne(self.solar_elevation);
        buf.put_f32_ne(self.spacecraft_velocity);
        buf.put_u64_ne(self.extent_id);
        buf.put_u32_ne(self.photons.len() as u32);
        for photon in &self.photons {
            photon.put(&mut buf);
        }
        buf.freeze()
    }

    pub fn decode(mut buf: &[u8]) -> Result<Self> {
        if buf.is_empty() || buf[0] != KIND_EXTENT {
            bail!("not an extent record");
        }
        buf.advance(1);
        let mut record = Self {
            track: buf.get_u8(),
            pair: buf.get_u8(),
            sc_orient: buf.get_u8(),
            valid: buf.get_u8() != 0,
            rgt: buf.get_u16_ne(),
            cycle: buf.get_u16_ne(),
            segment_id: buf.get_u32_ne(),
            segment_dist: buf.get_f64_ne(),
            extent_length: buf.get_f64_ne(),
            background_rate: buf.get_f64_ne(),
            solar_elevation: buf.get_f32_ne(),
            spacecraft_velocity: buf.get_f32_ne(),
            extent_id: buf.get_u64_ne(),
            photons: Vec::new(),
        };
        let count = buf.get_u32_ne() as usize;
        if buf.remaining() != count * PhotonRecord::ENCODED_LEN {
            bail!(
                "extent photon payload is {} bytes, expected {} photons",
                buf.remaining(),
                count
            );
        }
        record.photons.reserve(count);
        for _ in 0..count {
            record.photons.push(PhotonRecord::get(&mut buf));
        }
        Ok(record)
    }
}

/// What an ancillary record's elements are indexed by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AncillaryKind {
    Photon = 0,
    Extent = 1,
    Atl08 = 2,
}

impl AncillaryKind {
    fn from_u8(value: u8) -> Result<Self> {
        match value {
            0 => Ok(AncillaryKind::Photon),
            1 => Ok(AncillaryKind::Extent),
            2 => Ok(AncillaryKind::Atl08),
            other => bail!("unknown ancillary kind {}", other),
        }
    }
}

/// One caller-selected field, serialized element-by-element for the photons
/// (or segments) of a single extent.
#[derive(Debug, Clone, PartialEq)]
pub struct AncillaryRecord {
    pub extent_id: u64,
    pub anc_type: AncillaryKind,
    /// Position of the field in the caller's field list.
    pub field_index: u32,
    pub data_type: ElementType,
    pub num_elements: u32,
    pub data: Vec<u8>,
}

impl AncillaryRecord {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(1 + 8 + 1 + 4 + 1 + 4 + self.data.len());
        buf.put_u8(KIND_ANCILLARY);
        buf.put_u64_ne(self.extent_id);
        buf.put_u8(self.anc_type as u8);
        buf.put_u32_ne(self.field_index);
        buf.put_u8(self.data_type as u8);
        buf.put_u32_ne(self.num_elements);
        buf.put_slice(&self.data);
        buf.freeze()
    }

    pub fn decode(mut buf: &[u8]) -> Result<Self> {
        if buf.is_empty() || buf[0] != KIND_ANCILLARY {
            bail!("not an ancillary record");
        }
        buf.advance(1);
        let extent_id = buf.get_u64_ne();
        let anc_type = AncillaryKind::from_u8(buf.get_u8())?;
        let field_index = buf.get_u32_ne();
        let data_type = element_type_from_u8(buf.get_u8())?;
        let num_elements = buf.get_u32_ne();
        Ok(Self {
            extent_id,
            anc_type,
            field_index,
            data_type,
            num_elements,
            data: buf.to_vec(),
        })
    }
}

fn element_type_from_u8(value: u8) -> Result<ElementType> {
    Ok(match value {
        0 => ElementType::Int8,
        1 => ElementType::UInt8,
        2 => ElementType::Int16,
        3 => ElementType::UInt16,
        4 => ElementType::Int32,
        5 => ElementType::UInt32,
        6 => ElementType::Int64,
        7 => ElementType::UInt64,
        8 => ElementType::Float,
        9 => ElementType::Double,
        other => bail!("unknown element type {}", other),
    })
}

/// Failure surfaced into the output stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExceptionRecord {
    pub code: i32,
    pub level: i32,
    pub text: String,
}

impl ExceptionRecord {
    pub fn new(code: i32, level: i32, text: impl Into<String>) -> Self {
        Self {
            code,
            level,
            text: text.into(),
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(1 + 4 + 4 + EXCEPTION_TEXT_LEN);
        buf.put_u8(KIND_EXCEPTION);
        buf.put_i32_ne(self.code);
        buf.put_i32_ne(self.level);
        let bytes = self.text.as_bytes();
        let take = bytes.len().min(EXCEPTION_TEXT_LEN - 1);
        buf.put_slice(&bytes[..take]);
        buf.put_bytes(0, EXCEPTION_TEXT_LEN - take);
        buf.freeze()
    }

    pub fn decode(mut buf: &[u8]) -> Result<Self> {
        if buf.is_empty() || buf[0] != KIND_EXCEPTION {
            bail!("not an exception record");
        }
        buf.advance(1);
        let code = buf.get_i32_ne();
        let level = buf.get_i32_ne();
        if buf.remaining() != EXCEPTION_TEXT_LEN {
            bail!("exception text field is {} bytes", buf.remaining());
        }
        let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
        let text = String::from_utf8_lossy(&buf[..end]).into_owned();
        Ok(Self { code, level, text })
    }
}

/// Frame a group of already-encoded records belonging to one extent.
pub fn encode_container(records: &[Bytes]) -> Bytes {
    let payload: usize = records.iter().map(|r| 4 + r.len()).sum();
    let mut buf = BytesMut::with_capacity(1 + 4 + payload);
    buf.put_u8(KIND_CONTAINER);
    buf.put_u32_ne(records.len() as u32);
    for record in records {
        buf.put_u32_ne(record.len() as u32);
        buf.put_slice(record);
    }
    buf.freeze()
}

/// Split a container record back into its member records.
pub fn decode_container(mut buf: &[u8]) -> Result<Vec<Bytes>> {
    if buf.is_empty() || buf[0] != KIND_CONTAINER {
        bail!("not a container record");
    }
    buf.advance(1);
    let count = buf.get_u32_ne() as usize;
    let mut records = Vec::with_capacity(count);
    for _ in 0..count {
        if buf.remaining() < 4 {
            bail!("truncated container record");
        }
        let len = buf.get_u32_ne() as usize;
        if buf.remaining() < len {
            bail!("truncated container member");
        }
        records.push(Bytes::copy_from_slice(&buf[..len]));
        buf.advance(len);
    }
    Ok(records)
}
