//! Segment reader (C1)
//! Mission: yield X12 segments one at a time from either an in-memory byte
//! slice or a file, without materializing the whole input for the file path.
//!
//! Segments borrow from a rolling buffer (the arena from spec §9) that is
//! reset between reads, so callers must consume a `Segment` before asking
//! for the next one.

use crate::error::AppError;
use std::fs::File;
use std::io::{BufReader, Read};

/// Canonical X12 delimiters. The ISA header may override any of these;
/// `Delimiters::from_isa` discovers the actual ones in use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Delimiters {
    pub segment_terminator: u8,
    pub element_separator: u8,
    pub component_separator: u8,
    pub repetition_separator: u8,
}

impl Default for Delimiters {
    fn default() -> Self {
        Self {
            segment_terminator: b'~',
            element_separator: b'*',
            component_separator: b':',
            repetition_separator: b'^',
        }
    }
}

impl Delimiters {
    /// ISA is fixed-width (106 bytes including the terminator). Element
    /// separator is byte 3 (0-indexed), component separator is byte 104,
    /// and the terminator is whatever byte immediately follows ISA16.
    pub fn from_isa(header: &[u8]) -> Option<Self> {
        if header.len() < 106 || &header[0..3] != b"ISA" {
            return None;
        }
        Some(Self {
            element_separator: header[3],
            component_separator: header[104],
            segment_terminator: header[105],
            repetition_separator: Delimiters::default().repetition_separator,
        })
    }
}

/// A single decoded segment: its id (`"CLM"`, `"SV1"`, …) and its raw
/// elements, still strings — extractors (C2) decode these into strong types.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub id: String,
    pub elements: Vec<String>,
}

impl Segment {
    pub fn element(&self, idx: usize) -> Option<&str> {
        self.elements.get(idx).map(String::as_str)
    }
}

enum Source {
    Memory { data: Vec<u8>, pos: usize },
    File { reader: BufReader<File>, buf: Vec<u8> },
}

/// Reads segments from either a byte slice or a file, behind one type so
/// the small/large hint only picks the source, never the parsing path
/// (spec.md §9: one streaming parser, no small-file fast path).
pub struct SegmentSource {
    source: Source,
    delimiters: Delimiters,
    eof: bool,
}

const READ_CHUNK: usize = 64 * 1024;

impl SegmentSource {
    pub fn from_bytes(data: Vec<u8>) -> Result<Self, AppError> {
        let delimiters = Delimiters::from_isa(&data).unwrap_or_default();
        Ok(Self {
            source: Source::Memory { data, pos: 0 },
            delimiters,
            eof: false,
        })
    }

    pub fn from_file(path: &std::path::Path) -> Result<Self, AppError> {
        let mut file = File::open(path)
            .map_err(|e| AppError::input("upload_unreadable", format!("cannot open file: {e}")))?;
        let mut header = vec![0u8; 106];
        let read = file
            .read(&mut header)
            .map_err(|e| AppError::input("upload_unreadable", format!("cannot read file: {e}")))?;
        header.truncate(read);
        let delimiters = Delimiters::from_isa(&header).unwrap_or_default();

        let mut reader = BufReader::new(
            File::open(path)
                .map_err(|e| AppError::input("upload_unreadable", format!("cannot reopen file: {e}")))?,
        );
        let mut buf = Vec::with_capacity(READ_CHUNK);
        buf.resize(READ_CHUNK, 0);
        let n = Read::read(&mut reader, &mut buf).unwrap_or(0);
        buf.truncate(n);

        Ok(Self {
            source: Source::File { reader, buf },
            delimiters,
            eof: n == 0,
        })
    }

    pub fn delimiters(&self) -> Delimiters {
        self.delimiters
    }

    fn fill_more(&mut self) -> Result<bool, AppError> {
        match &mut self.source {
            Source::Memory { .. } => Ok(false),
            Source::File { reader, buf } => {
                let mut chunk = vec![0u8; READ_CHUNK];
                let n = reader
                    .read(&mut chunk)
                    .map_err(|e| AppError::input("upload_unreadable", format!("read error: {e}")))?;
                if n == 0 {
                    return Ok(false);
                }
                buf.extend_from_slice(&chunk[..n]);
                Ok(true)
            }
        }
    }

    /// Pulls the next raw segment body (bytes between terminators), CR/LF
    /// stripped. Returns `None` at clean EOF.
    fn next_raw(&mut self) -> Result<Option<Vec<u8>>, AppError> {
        let term = self.delimiters.segment_terminator;
        loop {
            match &mut self.source {
                Source::Memory { data, pos } => {
                    if *pos >= data.len() {
                        return Ok(None);
                    }
                    match data[*pos..].iter().position(|&b| b == term) {
                        Some(rel) => {
                            let raw = data[*pos..*pos + rel].to_vec();
                            *pos += rel + 1;
                            return Ok(Some(strip_crlf(raw)));
                        }
                        None => {
                            // Trailing bytes with no terminator: keep only if it
                            // looks like a segment id is present (§4.1).
                            let raw = data[*pos..].to_vec();
                            *pos = data.len();
                            if raw.iter().all(|b| b.is_ascii_whitespace()) {
                                return Ok(None);
                            }
                            return Ok(Some(strip_crlf(raw)));
                        }
                    }
                }
                Source::File { buf, .. } => {
                    if let Some(rel) = buf.iter().position(|&b| b == term) {
                        let raw: Vec<u8> = buf.drain(..=rel).collect();
                        let raw = raw[..raw.len() - 1].to_vec();
                        return Ok(Some(strip_crlf(raw)));
                    }
                    if self.eof {
                        if buf.is_empty() {
                            return Ok(None);
                        }
                        let raw = std::mem::take(buf);
                        if raw.iter().all(|b| b.is_ascii_whitespace()) {
                            return Ok(None);
                        }
                        return Ok(Some(strip_crlf(raw)));
                    }
                    if !self.fill_more()? {
                        self.eof = true;
                    }
                }
            }
        }
    }

    /// Yields the next decoded segment, or `None` at end of input.
    pub fn next_segment(&mut self) -> Result<Option<Segment>, AppError> {
        let Some(raw) = self.next_raw()? else {
            return Ok(None);
        };
        if raw.is_empty() {
            return self.next_segment();
        }
        let text = String::from_utf8_lossy(&raw);
        let sep = self.delimiters.element_separator as char;
        let mut parts = text.split(sep);
        let id = parts.next().unwrap_or("").trim().to_string();
        if id.is_empty() {
            return self.next_segment();
        }
        let elements = parts.map(|s| s.to_string()).collect();
        Ok(Some(Segment { id, elements }))
    }
}

fn strip_crlf(raw: Vec<u8>) -> Vec<u8> {
    raw.into_iter().filter(|&b| b != b'\r' && b != b'\n').collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Vec<u8> {
        b"ISA*00*          *00*          *ZZ*SENDER         *ZZ*RECEIVER       *230101*1253*^*00501*000000001*0*P*:~GS*HC*SENDER*RECEIVER*20230101*1253*1*X*005010X222A1~ST*837*0001~CLM*CTRL1*1000.00~SE*2*0001~GE*1*1~IEA*1*000000001~".to_vec()
    }

    #[test]
    fn reads_segments_from_memory_in_order() {
        let mut src = SegmentSource::from_bytes(sample()).unwrap();
        let mut ids = Vec::new();
        while let Some(seg) = src.next_segment().unwrap() {
            ids.push(seg.id);
        }
        assert_eq!(ids, vec!["ISA", "GS", "ST", "CLM", "SE", "GE", "IEA"]);
    }

    #[test]
    fn strips_crlf_inside_segments() {
        let mut data = b"ISA*00*          *00*          *ZZ*SENDER         *ZZ*RECEIVER       *230101*1253*^*00501*000000001*0*P*:~".to_vec();
        data.extend_from_slice(b"ST*837*0001\r\n~CLM*CTRL1*1000.00~");
        let mut src = SegmentSource::from_bytes(data).unwrap();
        src.next_segment().unwrap();
        let st = src.next_segment().unwrap().unwrap();
        assert_eq!(st.elements[0], "837");
        assert!(!st.elements[0].contains('\r'));
    }

    #[test]
    fn truncated_trailing_segment_with_id_is_kept() {
        let mut data = sample();
        data.truncate(data.len() - 1);
        data.extend_from_slice(b"REF*D9*abc");
        let mut src = SegmentSource::from_bytes(data).unwrap();
        let mut last = None;
        while let Some(seg) = src.next_segment().unwrap() {
            last = Some(seg);
        }
        assert_eq!(last.unwrap().id, "REF");
    }

    #[test]
    fn truncated_trailing_whitespace_only_is_dropped() {
        let mut data = sample();
        data.extend_from_slice(b"   ");
        let mut src = SegmentSource::from_bytes(data).unwrap();
        let mut count = 0;
        while src.next_segment().unwrap().is_some() {
            count += 1;
        }
        assert_eq!(count, 7);
    }

    #[test]
    fn discovers_nonstandard_delimiters_from_isa() {
        let data = b"ISA*00*          *00*          *ZZ*SENDER         *ZZ*RECEIVER       *230101*1253*^*00501*000000001*0*P*:~".to_vec();
        let src = SegmentSource::from_bytes(data).unwrap();
        assert_eq!(src.delimiters().element_separator, b'*');
        assert_eq!(src.delimiters().segment_terminator, b'~');
    }
}
