//! Chunk payload wire codec.
//!
//! A chunk payload is `zlib(be_u32(index_len_bytes) ‖ index ‖ values)` where
//! the index is little-endian i64 nanoseconds (UTC-naive) and the values are
//! little-endian f64 for float series, or NUL-separated UTF-8 strings for
//! text series with a lone 0x03 (ETX) byte standing for a null. Strings may
//! therefore not contain either reserved byte, which is enforced on encode.

use std::io::{Read, Write};

use byteorder::{BigEndian, ByteOrder, LittleEndian};
use bytes::{BufMut, BytesMut};
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;

use crate::error::{CResult, Error};
use crate::series::{Series, ValueKind, Values};

const SEP: u8 = 0x00;
const NULLMARK: u8 = 0x03; // ETX

/// Encodes a series into a compressed chunk payload.
pub fn serialize(ts: &Series) -> CResult<Vec<u8>> {
    let mut raw = BytesMut::with_capacity(4 + ts.len() * 16);
    raw.put_u32((ts.len() * 8) as u32);
    for &t in ts.index() {
        raw.put_i64_le(t);
    }
    match ts.values() {
        Values::Float(values) => {
            for &v in values {
                raw.put_f64_le(v);
            }
        }
        Values::Text(values) => {
            for (i, v) in values.iter().enumerate() {
                if i > 0 {
                    raw.put_u8(SEP);
                }
                match v {
                    Some(s) => {
                        if s.bytes().any(|b| b == SEP || b == NULLMARK) {
                            return Err(Error::BadInput(format!(
                                "string value at position {} contains a reserved byte",
                                i
                            )));
                        }
                        raw.put_slice(s.as_bytes());
                    }
                    None => raw.put_u8(NULLMARK),
                }
            }
        }
    }

    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&raw)?;
    Ok(encoder.finish()?)
}

/// Splits a decompressed chunk payload into its index and values bytes.
fn decode_chunk(payload: &[u8]) -> CResult<(Vec<u8>, Vec<u8>)> {
    let mut decoder = ZlibDecoder::new(payload);
    let mut raw = Vec::new();
    decoder
        .read_to_end(&mut raw)
        .map_err(|err| Error::Corrupt(format!("chunk decompression failed: {}", err)))?;

    if raw.len() < 4 {
        return Err(Error::Corrupt("chunk payload shorter than its header".into()));
    }
    let index_size = BigEndian::read_u32(&raw[..4]) as usize;
    let values_offset = index_size + 4;
    if values_offset > raw.len() {
        return Err(Error::Corrupt("chunk index length exceeds payload".into()));
    }
    Ok((raw[4..values_offset].to_vec(), raw[values_offset..].to_vec()))
}

/// Decodes a sequence of chunk payloads, given oldest first, into a single
/// series of the registered kind.
pub fn deserialize(chunks: &[impl AsRef<[u8]>], kind: ValueKind, tzaware: bool) -> CResult<Series> {
    let mut index: Vec<i64> = Vec::new();
    let mut counts: Vec<usize> = Vec::with_capacity(chunks.len());
    let mut values_parts: Vec<Vec<u8>> = Vec::with_capacity(chunks.len());

    for chunk in chunks {
        let (index_bytes, values_bytes) = decode_chunk(chunk.as_ref())?;
        if index_bytes.len() % 8 != 0 {
            return Err(Error::Corrupt("chunk index is not 8-byte aligned".into()));
        }
        let count = index_bytes.len() / 8;
        for i in 0..count {
            index.push(LittleEndian::read_i64(&index_bytes[i * 8..][..8]));
        }
        counts.push(count);
        values_parts.push(values_bytes);
    }

    let values = match kind {
        ValueKind::Float => {
            let mut values = Vec::with_capacity(index.len());
            for (part, &count) in values_parts.iter().zip(&counts) {
                if part.len() % 8 != 0 || part.len() / 8 != count {
                    return Err(Error::Corrupt(format!(
                        "chunk value count mismatch: {} index entries, {} value bytes",
                        count,
                        part.len()
                    )));
                }
                for i in 0..count {
                    values.push(LittleEndian::read_f64(&part[i * 8..][..8]));
                }
            }
            Values::Float(values)
        }
        ValueKind::Text => {
            let mut values = Vec::with_capacity(index.len());
            for (part, &count) in values_parts.iter().zip(&counts) {
                if count == 0 {
                    if !part.is_empty() {
                        return Err(Error::Corrupt("values in a chunk with an empty index".into()));
                    }
                    continue;
                }
                let fields: Vec<&[u8]> = part.split(|&b| b == SEP).collect();
                if fields.len() != count {
                    return Err(Error::Corrupt(format!(
                        "chunk value count mismatch: {} index entries, {} values",
                        count,
                        fields.len()
                    )));
                }
                for field in fields {
                    if field == [NULLMARK].as_slice() {
                        values.push(None);
                    } else {
                        values.push(Some(String::from_utf8(field.to_vec())?));
                    }
                }
            }
            Values::Text(values)
        }
    };

    if !index.windows(2).all(|w| w[0] < w[1]) {
        return Err(Error::Corrupt("chunk chain index is not strictly increasing".into()));
    }
    Ok(Series::trusted(index, values, tzaware))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn floats() -> Series {
        Series::from_floats(vec![(1, 1.5), (2, f64::NAN), (3, -3.25)]).unwrap()
    }

    fn texts() -> Series {
        Series::from_texts(vec![
            (1, Some("a".to_string())),
            (2, None),
            (3, Some("déjà vu".to_string())),
        ])
        .unwrap()
    }

    #[test]
    fn float_round_trip() -> CResult<()> {
        let ts = floats();
        let payload = serialize(&ts)?;
        assert_eq!(deserialize(&[payload], ValueKind::Float, false)?, ts);
        Ok(())
    }

    #[test]
    fn text_round_trip() -> CResult<()> {
        let ts = texts();
        let payload = serialize(&ts)?;
        assert_eq!(deserialize(&[payload], ValueKind::Text, false)?, ts);
        Ok(())
    }

    #[test]
    fn multi_chunk_reassembly() -> CResult<()> {
        let ts = Series::from_texts(vec![
            (1, Some("a".to_string())),
            (2, Some("b".to_string())),
            (3, Some("c".to_string())),
        ])?;
        let payloads: Vec<_> =
            ts.buckets(2).iter().map(serialize).collect::<CResult<_>>()?;
        assert_eq!(payloads.len(), 2);
        // Splitting values on NUL must not bleed across chunk boundaries.
        assert_eq!(deserialize(&payloads, ValueKind::Text, false)?, ts);
        Ok(())
    }

    #[test]
    fn reserved_bytes_are_rejected() {
        for bad in ["with\0nul", "with\x03etx"] {
            let ts = Series::from_texts(vec![(1, Some(bad.to_string()))]).unwrap();
            assert!(matches!(serialize(&ts), Err(Error::BadInput(_))));
        }
    }

    #[test]
    fn wire_layout_is_exact() -> CResult<()> {
        let ts = Series::from_floats(vec![(1, 2.0)])?;
        let payload = serialize(&ts)?;
        let mut decoder = ZlibDecoder::new(&payload[..]);
        let mut raw = Vec::new();
        decoder.read_to_end(&mut raw)?;
        assert_eq!(&raw[..4], &8u32.to_be_bytes());
        assert_eq!(&raw[4..12], &1i64.to_le_bytes());
        assert_eq!(&raw[12..20], &2f64.to_le_bytes());
        Ok(())
    }

    #[test]
    fn corrupt_payloads_are_rejected() {
        // not zlib at all
        assert!(matches!(
            deserialize(&[b"junk".to_vec()], ValueKind::Float, false),
            Err(Error::Corrupt(_))
        ));

        // length prefix beyond payload
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&100u32.to_be_bytes()).unwrap();
        encoder.write_all(&[0u8; 8]).unwrap();
        let payload = encoder.finish().unwrap();
        assert!(matches!(
            deserialize(&[payload], ValueKind::Float, false),
            Err(Error::Corrupt(_))
        ));

        // element count mismatch: two index entries, one value
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&16u32.to_be_bytes()).unwrap();
        encoder.write_all(&1i64.to_le_bytes()).unwrap();
        encoder.write_all(&2i64.to_le_bytes()).unwrap();
        encoder.write_all(&1f64.to_le_bytes()).unwrap();
        let payload = encoder.finish().unwrap();
        assert!(matches!(
            deserialize(&[payload], ValueKind::Float, false),
            Err(Error::Corrupt(_))
        ));
    }

    #[test]
    fn tzaware_flag_is_carried() -> CResult<()> {
        let payload = serialize(&floats())?;
        assert!(deserialize(&[payload], ValueKind::Float, true)?.tzaware());
        Ok(())
    }
}
