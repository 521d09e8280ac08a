//! Envelope & type detector (C3)
//! Mission: read ISA/GS/ST far enough to learn the transaction set and
//! control metadata, without scanning past the first ST (spec.md §4.3).

use super::segment::SegmentSource;
use crate::error::AppError;
use crate::models::FileType;

#[derive(Debug, Clone)]
pub struct Envelope {
    pub interchange_control_number: String,
    pub group_control_number: String,
    pub transaction_set_control_number: String,
    pub file_type: FileType,
}

/// Consumes segments from `source` up to and including the first `ST`,
/// returning the envelope plus the now-positioned source ready to yield
/// the first post-ST segment.
pub fn detect(source: &mut SegmentSource) -> Result<Envelope, AppError> {
    let mut interchange_control_number = String::new();
    let mut group_control_number = String::new();

    loop {
        let Some(segment) = source.next_segment()? else {
            return Err(AppError::ParseError(
                "reached end of input before finding ST segment".to_string(),
            ));
        };
        match segment.id.as_str() {
            "ISA" => {
                interchange_control_number = segment.element(12).unwrap_or_default().to_string();
            }
            "GS" => {
                group_control_number = segment.element(5).unwrap_or_default().to_string();
            }
            "ST" => {
                let transaction_set_code = segment.element(0).unwrap_or_default();
                let file_type = match transaction_set_code {
                    "837" => FileType::Claim837,
                    "835" => FileType::Remittance835,
                    other => {
                        return Err(AppError::ParseError(format!(
                            "unsupported transaction set code: {other}"
                        )))
                    }
                };
                let transaction_set_control_number =
                    segment.element(1).unwrap_or_default().to_string();
                return Ok(Envelope {
                    interchange_control_number,
                    group_control_number,
                    transaction_set_control_number,
                    file_type,
                });
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source(body: &str) -> SegmentSource {
        SegmentSource::from_bytes(body.as_bytes().to_vec()).unwrap()
    }

    #[test]
    fn detects_837_transaction_set() {
        let mut src = source(
            "ISA*00*          *00*          *ZZ*SENDER         *ZZ*RECEIVER       *230101*1253*^*00501*000000001*0*P*:~\
             GS*HC*SENDER*RECEIVER*20230101*1253*1*X*005010X222A1~\
             ST*837*0001~CLM*CTRL1*1000.00~",
        );
        let envelope = detect(&mut src).unwrap();
        assert_eq!(envelope.file_type, FileType::Claim837);
        assert_eq!(envelope.interchange_control_number, "000000001");
        assert_eq!(envelope.transaction_set_control_number, "0001");
    }

    #[test]
    fn detects_835_transaction_set() {
        let mut src = source(
            "ISA*00*          *00*          *ZZ*SENDER         *ZZ*RECEIVER       *230101*1253*^*00501*000000001*0*P*:~\
             GS*HP*SENDER*RECEIVER*20230101*1253*1*X*005010X221A1~\
             ST*835*0001~BPR*C*1000.00~",
        );
        let envelope = detect(&mut src).unwrap();
        assert_eq!(envelope.file_type, FileType::Remittance835);
    }

    #[test]
    fn missing_st_is_a_parse_error() {
        let mut src = source(
            "ISA*00*          *00*          *ZZ*SENDER         *ZZ*RECEIVER       *230101*1253*^*00501*000000001*0*P*:~",
        );
        assert!(detect(&mut src).is_err());
    }
}
