//! Table piggyback.
//!
//! A site answering on behalf of a missing entry serializes the sites
//! it knows for the queried name to JSON and carries it as the text of
//! a TXT record owned by the query name, placed first in the additional
//! section. The receiving side decodes that record and strips it before
//! the reply goes back to the client.
//!
//! Router to router the payload is always an array of sites. The
//! functions are generic so a whole table snapshot (an object) rides
//! the same convention.

use super::PiggybackError;
use hickory_proto::op::Message;
use hickory_proto::rr::rdata::TXT;
use hickory_proto::rr::{Name, RData, Record, RecordType};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// TTL of the table record; it must never be cached.
pub const TABLE_TTL: u32 = 0;

/// Longest character-string a TXT record may hold.
const MAX_TXT_CHUNK: usize = 255;

/// Split `text` into pieces of at most 255 bytes on char boundaries.
fn chunk_text(text: &str) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current = String::new();
    for c in text.chars() {
        if current.len() + c.len_utf8() > MAX_TXT_CHUNK {
            chunks.push(std::mem::take(&mut current));
        }
        current.push(c);
    }
    if !current.is_empty() || chunks.is_empty() {
        chunks.push(current);
    }
    chunks
}

/// Wrap `payload` as JSON in a TXT record owned by `owner`.
pub fn encode_table<T: Serialize + ?Sized>(
    owner: Name,
    payload: &T,
) -> Result<Record, PiggybackError> {
    let json = serde_json::to_string(payload)?;
    let txt = TXT::new(chunk_text(&json));
    Ok(Record::from_rdata(owner, TABLE_TTL, RData::TXT(txt)))
}

/// Decode the JSON carried by a table record.
pub fn decode_table<T: DeserializeOwned>(record: &Record) -> Result<T, PiggybackError> {
    if record.record_type() != RecordType::TXT {
        return Err(PiggybackError::InvalidTable(format!(
            "expected TXT, got {}",
            record.record_type()
        )));
    }
    let txt = match record.data() {
        Some(RData::TXT(txt)) => txt,
        _ => {
            return Err(PiggybackError::InvalidTable(
                "record carries no text".to_string(),
            ))
        }
    };

    let bytes: Vec<u8> = txt
        .txt_data()
        .iter()
        .flat_map(|chunk| chunk.iter().copied())
        .collect();
    Ok(serde_json::from_slice(&bytes)?)
}

/// Put the table record first in the additional section.
pub fn attach_table<T: Serialize + ?Sized>(
    message: &mut Message,
    owner: Name,
    payload: &T,
) -> Result<(), PiggybackError> {
    let record = encode_table(owner, payload)?;
    let rest = message.take_additionals();
    message.add_additional(record);
    message.add_additionals(rest);
    Ok(())
}

/// Decode the first additional record and remove it on success.
pub fn take_table<T: DeserializeOwned>(message: &mut Message) -> Result<T, PiggybackError> {
    let payload = match message.additionals().first() {
        Some(record) => decode_table(record)?,
        None => return Err(PiggybackError::MissingTable),
    };

    let mut rest = message.take_additionals();
    rest.remove(0);
    message.add_additionals(rest);
    Ok(payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{EdgeSite, Point};
    use crate::domain::services::ServiceTable;
    use hickory_proto::rr::rdata::A;
    use hickory_proto::serialize::binary::{BinDecodable, BinEncodable};
    use std::collections::BTreeMap;
    use std::net::Ipv4Addr;
    use std::str::FromStr;

    fn owner() -> Name {
        Name::from_str("checkout.").unwrap()
    }

    fn site(n: u8) -> EdgeSite {
        EdgeSite::new(
            std::net::IpAddr::V4(Ipv4Addr::new(203, 0, 113, n)),
            Point::new(f64::from(n), -f64::from(n)),
        )
    }

    #[test]
    fn test_chunking() {
        assert_eq!(chunk_text(""), vec![String::new()]);
        assert_eq!(chunk_text("abc"), vec!["abc".to_string()]);

        let long = "x".repeat(600);
        let chunks = chunk_text(&long);
        assert_eq!(chunks.len(), 3);
        assert!(chunks.iter().all(|c| c.len() <= MAX_TXT_CHUNK));
        assert_eq!(chunks.concat(), long);
    }

    #[test]
    fn test_chunking_respects_char_boundaries() {
        let text = "é".repeat(200);
        let chunks = chunk_text(&text);
        assert!(chunks.iter().all(|c| c.len() <= MAX_TXT_CHUNK));
        assert_eq!(chunks.concat(), text);
    }

    #[test]
    fn test_site_list_round_trip() {
        let sites = vec![site(1), site(2)];
        let record = encode_table(owner(), &sites).unwrap();
        assert_eq!(record.ttl(), TABLE_TTL);
        assert_eq!(record.name(), &owner());

        let back: Vec<EdgeSite> = decode_table(&record).unwrap();
        assert_eq!(back, sites);
    }

    #[test]
    fn test_service_table_round_trip_through_wire() {
        let table = ServiceTable::new();
        for n in 1..=30u8 {
            table.update(site(n), &["echo".to_string(), format!("svc-{}", n)]);
        }
        let snapshot = table.snapshot();

        let mut msg = Message::new();
        attach_table(&mut msg, owner(), &snapshot).unwrap();
        let bytes = msg.to_bytes().unwrap();
        let mut parsed = Message::from_bytes(&bytes).unwrap();

        let back: BTreeMap<String, crate::domain::EdgeSiteSet> = take_table(&mut parsed).unwrap();
        assert_eq!(back, snapshot);
        assert!(parsed.additionals().is_empty());
    }

    #[test]
    fn test_attach_goes_first_and_take_strips_it() {
        let mut msg = Message::new();
        msg.add_additional(Record::from_rdata(
            Name::from_str("glue.example.").unwrap(),
            60,
            RData::A(A(Ipv4Addr::new(10, 0, 0, 1))),
        ));
        attach_table(&mut msg, owner(), &vec![site(5)]).unwrap();
        assert_eq!(msg.additionals()[0].record_type(), RecordType::TXT);

        let sites: Vec<EdgeSite> = take_table(&mut msg).unwrap();
        assert_eq!(sites, vec![site(5)]);
        assert_eq!(msg.additionals().len(), 1);
        assert_eq!(msg.additionals()[0].record_type(), RecordType::A);
    }

    #[test]
    fn test_take_missing_table() {
        let mut msg = Message::new();
        assert!(matches!(
            take_table::<Vec<EdgeSite>>(&mut msg),
            Err(PiggybackError::MissingTable)
        ));
    }

    #[test]
    fn test_take_rejects_non_text_first_record() {
        let mut msg = Message::new();
        msg.add_additional(Record::from_rdata(
            owner(),
            0,
            RData::A(A(Ipv4Addr::new(10, 0, 0, 1))),
        ));
        assert!(matches!(
            take_table::<Vec<EdgeSite>>(&mut msg),
            Err(PiggybackError::InvalidTable(_))
        ));
        assert_eq!(msg.additionals().len(), 1);
    }

    #[test]
    fn test_take_rejects_bad_json() {
        let mut msg = Message::new();
        msg.add_additional(Record::from_rdata(
            owner(),
            0,
            RData::TXT(TXT::new(vec!["{not json".to_string()])),
        ));
        assert!(matches!(
            take_table::<Vec<EdgeSite>>(&mut msg),
            Err(PiggybackError::Json(_))
        ));
    }

    #[test]
    fn test_take_rejects_wrong_shape() {
        // An object where a list of sites is expected.
        let mut msg = Message::new();
        attach_table(&mut msg, owner(), &serde_json::json!({"echo": []})).unwrap();
        assert!(take_table::<Vec<EdgeSite>>(&mut msg).is_err());
    }
}
