// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Length-encoded record framing.
//!
//! A record is a big-endian `u32` field count followed, for each field, by
//! a big-endian `u32` byte length and that many bytes of UTF-8. There are
//! no delimiters, so field content may contain any character.

use std::io::{self, BufWriter, ErrorKind, Read, Write};

/// Largest field the reader accepts. Anything bigger is treated as a
/// corrupt length prefix rather than an allocation request.
pub const MAX_FIELD_LENGTH: usize = 256 * 1024 * 1024;

/// Largest number of fields the reader accepts in one record.
pub const MAX_FIELD_COUNT: usize = 1024 * 1024;

/// Writes records to a buffered stream.
pub struct LengthEncodedWriter<W: Write> {
    stream: BufWriter<W>,
    scratch: Vec<u8>,
}

impl<W: Write> LengthEncodedWriter<W> {
    pub fn new(stream: W) -> Self {
        Self {
            stream: BufWriter::new(stream),
            scratch: Vec::new(),
        }
    }

    /// Encode a whole record before handing it to the stream, so a failed
    /// encode never leaves a partial record behind.
    pub fn write_record<S: AsRef<str>>(&mut self, fields: &[S]) -> io::Result<()> {
        self.scratch.clear();
        let count = u32::try_from(fields.len())
            .map_err(|_| io::Error::new(ErrorKind::InvalidInput, "too many fields in record"))?;
        self.scratch.extend_from_slice(&count.to_be_bytes());
        for field in fields {
            let bytes = field.as_ref().as_bytes();
            let len = u32::try_from(bytes.len())
                .map_err(|_| io::Error::new(ErrorKind::InvalidInput, "field too long"))?;
            self.scratch.extend_from_slice(&len.to_be_bytes());
            self.scratch.extend_from_slice(bytes);
        }
        self.stream.write_all(&self.scratch)
    }

    pub fn flush(&mut self) -> io::Result<()> {
        self.stream.flush()
    }

    /// Flush and give back the underlying stream.
    pub fn into_inner(self) -> io::Result<W> {
        self.stream.into_inner().map_err(|e| e.into_error())
    }
}

/// Reads records written by [`LengthEncodedWriter`], one at a time.
pub struct LengthEncodedReader<R: Read> {
    stream: R,
}

impl<R: Read> LengthEncodedReader<R> {
    pub fn new(stream: R) -> Self {
        Self { stream }
    }

    /// Read the next record. Returns `Ok(None)` only when the stream ends
    /// exactly on a record boundary; a stream that ends inside a record is
    /// an `UnexpectedEof` error.
    pub fn read_record(&mut self) -> io::Result<Option<Vec<String>>> {
        let mut prefix = [0u8; 4];
        if !self.read_prefix(&mut prefix)? {
            return Ok(None);
        }

        let count = u32::from_be_bytes(prefix) as usize;
        if count > MAX_FIELD_COUNT {
            return Err(io::Error::new(
                ErrorKind::InvalidData,
                format!("record declares {} fields", count),
            ));
        }

        let mut fields = Vec::with_capacity(count.min(64));
        for _ in 0..count {
            self.stream.read_exact(&mut prefix)?;
            let len = u32::from_be_bytes(prefix) as usize;
            if len > MAX_FIELD_LENGTH {
                return Err(io::Error::new(
                    ErrorKind::InvalidData,
                    format!("field declares {} bytes", len),
                ));
            }
            let mut buf = vec![0u8; len];
            self.stream.read_exact(&mut buf)?;
            let field = String::from_utf8(buf)
                .map_err(|e| io::Error::new(ErrorKind::InvalidData, e))?;
            fields.push(field);
        }
        Ok(Some(fields))
    }

    /// Fill `prefix`, distinguishing a clean end of stream (nothing read)
    /// from a truncated prefix.
    fn read_prefix(&mut self, prefix: &mut [u8; 4]) -> io::Result<bool> {
        let mut filled = 0;
        while filled < prefix.len() {
            match self.stream.read(&mut prefix[filled..]) {
                Ok(0) if filled == 0 => return Ok(false),
                Ok(0) => {
                    return Err(io::Error::new(
                        ErrorKind::UnexpectedEof,
                        format!("stream ended after {} bytes of a length prefix", filled),
                    ));
                }
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(true)
    }
}

impl<R: Read> Iterator for LengthEncodedReader<R> {
    type Item = io::Result<Vec<String>>;

    fn next(&mut self) -> Option<Self::Item> {
        self.read_record().transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(records: &[Vec<&str>]) -> Vec<u8> {
        let mut writer = LengthEncodedWriter::new(Vec::new());
        for record in records {
            writer.write_record(record).unwrap();
        }
        writer.into_inner().unwrap()
    }

    #[test]
    fn test_framing_layout() {
        let bytes = encode(&[vec!["ab", ""]]);
        assert_eq!(
            bytes,
            vec![0, 0, 0, 2, 0, 0, 0, 2, b'a', b'b', 0, 0, 0, 0]
        );
    }

    #[test]
    fn test_records_read_back_in_order() {
        let records = vec![
            vec!["time", "airline", "responsetime", "."],
            vec!["1403481600", "AAL", "132.2", ""],
            vec![],
            vec!["multi\nline, with \"quotes\"", "ünïcødé", "", "f1"],
        ];
        let bytes = encode(&records);

        let reader = LengthEncodedReader::new(bytes.as_slice());
        let decoded: Vec<Vec<String>> = reader.map(|r| r.unwrap()).collect();
        assert_eq!(decoded, records);
    }

    #[test]
    fn test_empty_stream_has_no_records() {
        let mut reader = LengthEncodedReader::new(&b""[..]);
        assert!(reader.read_record().unwrap().is_none());
    }

    #[test]
    fn test_truncated_prefix_is_an_error() {
        let mut bytes = encode(&[vec!["a"]]);
        bytes.extend_from_slice(&[0, 0]);

        let mut reader = LengthEncodedReader::new(bytes.as_slice());
        assert_eq!(reader.read_record().unwrap().unwrap(), vec!["a"]);
        let err = reader.read_record().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnexpectedEof);
    }

    #[test]
    fn test_truncated_field_is_an_error() {
        let mut bytes = encode(&[vec!["abcdef"]]);
        bytes.truncate(bytes.len() - 2);

        let mut reader = LengthEncodedReader::new(bytes.as_slice());
        assert_eq!(
            reader.read_record().unwrap_err().kind(),
            ErrorKind::UnexpectedEof
        );
    }

    #[test]
    fn test_invalid_utf8_is_rejected() {
        let bytes = vec![0u8, 0, 0, 1, 0, 0, 0, 2, 0xC3, 0x28];
        let mut reader = LengthEncodedReader::new(bytes.as_slice());
        assert_eq!(
            reader.read_record().unwrap_err().kind(),
            ErrorKind::InvalidData
        );
    }

    #[test]
    fn test_oversized_field_length_is_rejected() {
        let bytes = vec![0u8, 0, 0, 1, 0xFF, 0xFF, 0xFF, 0xFF];
        let mut reader = LengthEncodedReader::new(bytes.as_slice());
        assert_eq!(
            reader.read_record().unwrap_err().kind(),
            ErrorKind::InvalidData
        );
    }

    #[test]
    fn test_empty_fields_and_empty_records() {
        let records = vec![vec![], vec!["", "", ""], vec!["", "x"]];
        let bytes = encode(&records);
        assert_eq!(&bytes[..4], &[0, 0, 0, 0]);

        let decoded: Vec<Vec<String>> = LengthEncodedReader::new(bytes.as_slice())
            .map(|r| r.unwrap())
            .collect();
        assert_eq!(decoded, records);
    }

    #[test]
    fn test_length_counts_bytes_not_chars() {
        let bytes = encode(&[vec!["né", "日本"]]);
        assert_eq!(&bytes[4..8], &3u32.to_be_bytes());
        assert_eq!(&bytes[11..15], &6u32.to_be_bytes());
        assert_eq!(bytes.len(), 4 + 4 + 3 + 4 + 6);

        let mut reader = LengthEncodedReader::new(bytes.as_slice());
        assert_eq!(reader.read_record().unwrap().unwrap(), vec!["né", "日本"]);
        assert!(reader.read_record().unwrap().is_none());
    }

    #[test]
    fn test_field_length_at_limit_is_accepted() {
        // Only the prefixes are present: a length at the limit gets past
        // validation and fails on the missing payload.
        let mut bytes = 1u32.to_be_bytes().to_vec();
        bytes.extend_from_slice(&(MAX_FIELD_LENGTH as u32).to_be_bytes());
        let mut reader = LengthEncodedReader::new(bytes.as_slice());
        assert_eq!(
            reader.read_record().unwrap_err().kind(),
            ErrorKind::UnexpectedEof
        );

        let mut bytes = 1u32.to_be_bytes().to_vec();
        bytes.extend_from_slice(&(MAX_FIELD_LENGTH as u32 + 1).to_be_bytes());
        let mut reader = LengthEncodedReader::new(bytes.as_slice());
        assert_eq!(
            reader.read_record().unwrap_err().kind(),
            ErrorKind::InvalidData
        );
    }

    #[test]
    fn test_field_count_limit() {
        let bytes = (MAX_FIELD_COUNT as u32 + 1).to_be_bytes();
        let mut reader = LengthEncodedReader::new(&bytes[..]);
        assert_eq!(
            reader.read_record().unwrap_err().kind(),
            ErrorKind::InvalidData
        );

        // At the limit the count is accepted and the first field is missing.
        let bytes = (MAX_FIELD_COUNT as u32).to_be_bytes();
        let mut reader = LengthEncodedReader::new(&bytes[..]);
        assert_eq!(
            reader.read_record().unwrap_err().kind(),
            ErrorKind::UnexpectedEof
        );
    }
}
