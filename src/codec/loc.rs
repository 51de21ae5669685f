//! Coordinate piggyback.
//!
//! A site advertises where it is by appending a LOC record (RFC 1876)
//! owned by [`SITE_RECORD_NAME`] to the additional section of the
//! queries it forwards. The record is always the last one of the
//! section: it is appended last and taken from the tail.
//!
//! hickory-proto has no typed LOC rdata, so the 16-byte RDATA is built
//! and read here and carried as an opaque record of type 29.

use super::PiggybackError;
use crate::domain::value_objects::Point;
use hickory_proto::op::Message;
use hickory_proto::rr::rdata::NULL;
use hickory_proto::rr::{Name, RData, Record, RecordType};
use hickory_proto::serialize::binary::BinEncodable;

/// Owner name of the coordinate record.
pub const SITE_RECORD_NAME: &str = "edge.site.";

/// Wire type code of LOC.
pub const LOC_TYPE_CODE: u16 = 29;

/// TTL of the coordinate record; it must never be cached.
pub const LOC_TTL: u32 = 0;

const LOC_RDATA_LEN: usize = 16;
const LOC_VERSION: u8 = 0;
// Sizes and precisions use the RFC 1876 base/exponent encoding.
const LOC_SIZE_1M: u8 = 0x12;
const LOC_HORIZ_PRE_10KM: u8 = 0x16;
const LOC_VERT_PRE_10M: u8 = 0x13;

/// Zero reference of both latitude and longitude.
const LOC_EQUATOR: i64 = 1 << 31;
/// Thousandths of an arc second per degree.
const LOC_DEGREES: f64 = 3_600_000.0;
/// Altitude reference, 100 000 m below the WGS 84 spheroid, in cm.
const LOC_ALTITUDE_BASE: u32 = 10_000_000;

pub fn loc_record_type() -> RecordType {
    RecordType::Unknown(LOC_TYPE_CODE)
}

pub fn site_record_name() -> Result<Name, PiggybackError> {
    Ok(Name::from_ascii(SITE_RECORD_NAME)?)
}

fn degrees_to_raw(degrees: f64) -> u32 {
    (LOC_EQUATOR + (degrees * LOC_DEGREES).round() as i64) as u32
}

fn raw_to_degrees(raw: u32) -> f64 {
    (i64::from(raw) - LOC_EQUATOR) as f64 / LOC_DEGREES
}

/// Build the LOC RDATA for `point`.
pub fn encode_loc_rdata(point: &Point) -> [u8; LOC_RDATA_LEN] {
    let mut out = [0u8; LOC_RDATA_LEN];
    out[0] = LOC_VERSION;
    out[1] = LOC_SIZE_1M;
    out[2] = LOC_HORIZ_PRE_10KM;
    out[3] = LOC_VERT_PRE_10M;
    out[4..8].copy_from_slice(&degrees_to_raw(point.lat).to_be_bytes());
    out[8..12].copy_from_slice(&degrees_to_raw(point.lon).to_be_bytes());
    out[12..16].copy_from_slice(&LOC_ALTITUDE_BASE.to_be_bytes());
    out
}

/// Read a point back out of LOC RDATA.
pub fn decode_loc_rdata(data: &[u8]) -> Result<Point, PiggybackError> {
    if data.len() != LOC_RDATA_LEN {
        return Err(PiggybackError::InvalidLocation(format!(
            "rdata is {} bytes, expected {}",
            data.len(),
            LOC_RDATA_LEN
        )));
    }
    if data[0] != LOC_VERSION {
        return Err(PiggybackError::InvalidLocation(format!(
            "unsupported version {}",
            data[0]
        )));
    }

    let lat = raw_to_degrees(u32::from_be_bytes([data[4], data[5], data[6], data[7]]));
    let lon = raw_to_degrees(u32::from_be_bytes([data[8], data[9], data[10], data[11]]));
    let point = Point::new(lat, lon);

    if !point.is_valid() {
        return Err(PiggybackError::InvalidLocation(format!(
            "coordinates out of range {}",
            point
        )));
    }
    Ok(point)
}

/// The coordinate record for `point`.
pub fn encode_location(point: &Point) -> Result<Record, PiggybackError> {
    let rdata = RData::Unknown {
        code: loc_record_type(),
        rdata: NULL::with(encode_loc_rdata(point).to_vec()),
    };
    let record = Record::from_rdata(site_record_name()?, LOC_TTL, rdata);
    tracing::trace!("encoded {} as LOC record", point);
    Ok(record)
}

/// Decode a coordinate record, checking owner name and type.
pub fn decode_location(record: &Record) -> Result<Point, PiggybackError> {
    let expected = site_record_name()?;
    if record.record_type() != loc_record_type() || *record.name() != expected {
        return Err(PiggybackError::InvalidLocation(format!(
            "expected LOC at {}, got {} at {}",
            SITE_RECORD_NAME,
            record.record_type(),
            record.name()
        )));
    }

    match record.data() {
        Some(RData::Unknown { rdata, .. }) => decode_loc_rdata(&rdata.to_bytes()?),
        _ => Err(PiggybackError::InvalidLocation(
            "record carries no LOC rdata".to_string(),
        )),
    }
}

/// Append this site's coordinate record as the last additional record.
pub fn attach_location(message: &mut Message, point: &Point) -> Result<(), PiggybackError> {
    message.add_additional(encode_location(point)?);
    Ok(())
}

/// Take the coordinate record off the tail of the additional section.
///
/// `Ok(None)` when the last record is not a LOC record (an ordinary
/// client query). A LOC record that does not decode is an error and is
/// left in place.
pub fn take_location(message: &mut Message) -> Result<Option<Point>, PiggybackError> {
    let is_loc = message
        .additionals()
        .last()
        .map(|r| r.record_type() == loc_record_type())
        .unwrap_or(false);
    if !is_loc {
        return Ok(None);
    }

    let mut additionals = message.take_additionals();
    let decoded = additionals.last().map(decode_location);
    let point = match decoded {
        Some(Ok(point)) => {
            additionals.pop();
            Some(point)
        }
        Some(Err(e)) => {
            message.add_additionals(additionals);
            return Err(e);
        }
        None => None,
    };
    message.add_additionals(additionals);
    Ok(point)
}
