//! Block partitioner (C4)
//! Mission: group segments into claim blocks (837) or remittance-claim
//! blocks (835), streaming only the current block (spec.md §4.4).
//!
//! Partitioning is segment-level, not loop-aware: everything between two
//! `CLM`/`CLP` markers (SV1/SV2/CAS/DTP/…) belongs to the preceding block,
//! whichever loop it nominally came from.

use super::segment::{Segment, SegmentSource};
use crate::error::AppError;
use crate::models::FileType;

/// One claim block (837) or remittance-claim block (835): the leading
/// `CLM`/`CLP` segment plus everything up to the next block boundary.
pub struct Block {
    pub segments: Vec<Segment>,
}

impl Block {
    pub fn header(&self) -> &Segment {
        &self.segments[0]
    }

    pub fn find_all<'a>(&'a self, id: &'a str) -> impl Iterator<Item = &'a Segment> + 'a {
        self.segments.iter().filter(move |s| s.id == id)
    }
}

/// Streams blocks out of a segment source already positioned just after ST.
pub struct Partitioner<'a> {
    source: &'a mut SegmentSource,
    block_marker: &'static str,
    lookahead: Option<Segment>,
    header: Option<Vec<Segment>>,
    finished: bool,
}

impl<'a> Partitioner<'a> {
    pub fn new(source: &'a mut SegmentSource, file_type: FileType) -> Self {
        let block_marker = match file_type {
            FileType::Claim837 => "CLM",
            FileType::Remittance835 => "CLP",
        };
        Self {
            source,
            block_marker,
            lookahead: None,
            header: None,
            finished: false,
        }
    }

    /// Transaction-header segments preceding the first block marker (e.g.
    /// the remittance-level BPR/TRN for 835, or submitter/biller NM1s for
    /// 837). Populated as a side effect of the first `next_block` call.
    pub fn take_header(&mut self) -> Vec<Segment> {
        self.header.take().unwrap_or_default()
    }

    fn is_transaction_end(id: &str) -> bool {
        matches!(id, "SE" | "GE" | "IEA")
    }

    pub fn next_block(&mut self) -> Result<Option<Block>, AppError> {
        if self.finished {
            return Ok(None);
        }

        let mut segments = Vec::new();
        let mut header = if self.header.is_none() {
            Some(Vec::new())
        } else {
            None
        };

        let mut first = match self.lookahead.take() {
            Some(s) => Some(s),
            None => self.source.next_segment()?,
        };

        // Skip/collect header segments until we see the block marker.
        while let Some(seg) = first {
            if seg.id == self.block_marker {
                segments.push(seg);
                break;
            }
            if Self::is_transaction_end(&seg.id) {
                self.finished = true;
                if let Some(h) = header.take() {
                    self.header = Some(h);
                }
                return Ok(None);
            }
            if let Some(h) = header.as_mut() {
                h.push(seg);
            }
            first = self.source.next_segment()?;
        }

        if segments.is_empty() {
            self.finished = true;
            if let Some(h) = header.take() {
                self.header = Some(h);
            }
            return Ok(None);
        }

        if let Some(h) = header.take() {
            self.header = Some(h);
        }

        loop {
            match self.source.next_segment()? {
                None => {
                    self.finished = true;
                    break;
                }
                Some(seg) if seg.id == self.block_marker => {
                    self.lookahead = Some(seg);
                    break;
                }
                Some(seg) if Self::is_transaction_end(&seg.id) => {
                    self.finished = true;
                    break;
                }
                Some(seg) => segments.push(seg),
            }
        }

        Ok(Some(Block { segments }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn body_837() -> Vec<u8> {
        b"ISA*00*          *00*          *ZZ*SENDER         *ZZ*RECEIVER       *230101*1253*^*00501*000000001*0*P*:~\
          GS*HC*SENDER*RECEIVER*20230101*1253*1*X*005010X222A1~\
          ST*837*0001~\
          NM1*41*2*SUBMITTER*****46*SUB1~\
          CLM*CTRL1*1000.00~SV1*HC:99213*1000.00*UN*1~\
          CLM*CTRL2*500.00~SV1*HC:99214*500.00*UN*1~\
          SE*6*0001~"
            .to_vec()
    }

    #[test]
    fn partitions_837_into_claim_blocks() {
        let mut src = SegmentSource::from_bytes(body_837()).unwrap();
        let envelope = super::super::envelope::detect(&mut src).unwrap();
        let mut part = Partitioner::new(&mut src, envelope.file_type);

        let first = part.next_block().unwrap().unwrap();
        let header = part.take_header();
        assert_eq!(header.len(), 1);
        assert_eq!(header[0].id, "NM1");
        assert_eq!(first.header().elements[0], "CTRL1");
        assert_eq!(first.segments.len(), 2);

        let second = part.next_block().unwrap().unwrap();
        assert_eq!(second.header().elements[0], "CTRL2");

        assert!(part.next_block().unwrap().is_none());
    }

    #[test]
    fn envelope_only_file_yields_no_blocks() {
        let data = b"ISA*00*          *00*          *ZZ*SENDER         *ZZ*RECEIVER       *230101*1253*^*00501*000000001*0*P*:~\
             GS*HC*SENDER*RECEIVER*20230101*1253*1*X*005010X222A1~\
             ST*837*0001~SE*1*0001~".to_vec();
        let mut src = SegmentSource::from_bytes(data).unwrap();
        let envelope = super::super::envelope::detect(&mut src).unwrap();
        let mut part = Partitioner::new(&mut src, envelope.file_type);
        assert!(part.next_block().unwrap().is_none());
    }
}
