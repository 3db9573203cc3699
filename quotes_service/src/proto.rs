/// proto.rs — Wire format for the quotes request/reply bus
///
/// Requests and replies travel as MessagePack maps. Reply columns are raw
/// little-endian byte buffers (i64 for time, f64 for prices/volume) so the
/// client can reassemble the series without per-element decoding.
use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;

use crate::error::QuotesError;
use crate::series::BarSeries;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotesRequest {
    pub request_id: String,
    pub source: String,
    pub symbol: String,
    pub timeframe: String,
    /// ISO-8601 UTC.
    pub history_start: String,
    /// ISO-8601 UTC; absent means "until now".
    pub history_end: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplyStatus {
    Success,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArraySizes {
    pub time: usize,
    pub open: usize,
    pub high: usize,
    pub low: usize,
    pub close: usize,
    pub volume: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplyMetadata {
    pub request_id: String,
    pub status: ReplyStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub array_sizes: Option<ArraySizes>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BinaryColumns {
    pub time: ByteBuf,
    pub open: ByteBuf,
    pub high: ByteBuf,
    pub low: ByteBuf,
    pub close: ByteBuf,
    pub volume: ByteBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotesReply {
    pub metadata: ReplyMetadata,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub binary_data: Option<BinaryColumns>,
}

impl QuotesReply {
    pub fn success(request_id: &str, series: &BarSeries) -> Self {
        Self {
            metadata: ReplyMetadata {
                request_id: request_id.to_owned(),
                status: ReplyStatus::Success,
                error: None,
                array_sizes: Some(ArraySizes {
                    time: series.time.len(),
                    open: series.open.len(),
                    high: series.high.len(),
                    low: series.low.len(),
                    close: series.close.len(),
                    volume: series.volume.len(),
                }),
            },
            binary_data: Some(BinaryColumns {
                time: ByteBuf::from(encode_i64(&series.time)),
                open: ByteBuf::from(encode_f64(&series.open)),
                high: ByteBuf::from(encode_f64(&series.high)),
                low: ByteBuf::from(encode_f64(&series.low)),
                close: ByteBuf::from(encode_f64(&series.close)),
                volume: ByteBuf::from(encode_f64(&series.volume)),
            }),
        }
    }

    pub fn error(request_id: &str, message: &str) -> Self {
        Self {
            metadata: ReplyMetadata {
                request_id: request_id.to_owned(),
                status: ReplyStatus::Error,
                error: Some(message.to_owned()),
                array_sizes: None,
            },
            binary_data: None,
        }
    }

    /// Reassemble the bar series from a success reply.
    pub fn into_series(self) -> Result<BarSeries, QuotesError> {
        let columns = self
            .binary_data
            .ok_or_else(|| QuotesError::Internal("reply without binary data".into()))?;
        Ok(BarSeries {
            time: decode_i64(&columns.time),
            open: decode_f64(&columns.open),
            high: decode_f64(&columns.high),
            low: decode_f64(&columns.low),
            close: decode_f64(&columns.close),
            volume: decode_f64(&columns.volume),
        })
    }
}

/// Map-keyed MessagePack, so optional fields stay optional across versions.
pub fn pack<T: Serialize>(value: &T) -> Result<Vec<u8>, QuotesError> {
    Ok(rmp_serde::to_vec_named(value)?)
}

pub fn unpack<'a, T: Deserialize<'a>>(bytes: &'a [u8]) -> Result<T, QuotesError> {
    Ok(rmp_serde::from_slice(bytes)?)
}

pub fn encode_i64(values: &[i64]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

pub fn encode_f64(values: &[f64]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

pub fn decode_i64(bytes: &[u8]) -> Vec<i64> {
    bytes
        .chunks_exact(8)
        .map(|c| i64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]))
        .collect()
}

pub fn decode_f64(bytes: &[u8]) -> Vec<f64> {
    bytes
        .chunks_exact(8)
        .map(|c| f64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::series::Bar;

    #[test]
    fn reply_round_trip() {
        let series: BarSeries = [Bar {
            time: 3_600_000,
            open: 1.0,
            high: 2.0,
            low: 0.5,
            close: 1.5,
            volume: 42.0,
        }]
        .into_iter()
        .collect();

        let reply = QuotesReply::success("req-1", &series);
        let bytes = pack(&reply).unwrap();
        let decoded: QuotesReply = unpack(&bytes).unwrap();
        assert_eq!(decoded.metadata.status, ReplyStatus::Success);
        assert_eq!(decoded.into_series().unwrap(), series);
    }

    #[test]
    fn error_reply_has_no_columns() {
        let reply = QuotesReply::error("req-2", "no market for symbol X");
        let bytes = pack(&reply).unwrap();
        let decoded: QuotesReply = unpack(&bytes).unwrap();
        assert_eq!(decoded.metadata.status, ReplyStatus::Error);
        assert!(decoded.binary_data.is_none());
        assert!(decoded.metadata.error.unwrap().contains("no market"));
    }
}
