/// client.rs — Blocking counterpart of the quotes service
///
/// Backtesting workers use this from their synchronous bar-loop side: push a
/// request onto the service's inbound list, then block on the per-request
/// reply slot. No reply within the timeout means `DataNotReceived`; the
/// reply-slot TTL keeps the service from answering into the void later.
use tracing::debug;
use uuid::Uuid;

use crate::config::QuotesConfig;
use crate::error::QuotesError;
use crate::proto::{pack, unpack, QuotesReply, QuotesRequest, ReplyStatus};
use crate::series::BarSeries;
use crate::timeframe::Timeframe;

pub struct QuotesClient {
    redis: redis::Client,
    request_list: String,
    response_prefix: String,
    timeout_secs: u64,
}

impl QuotesClient {
    pub fn new(cfg: &QuotesConfig) -> Result<Self, QuotesError> {
        Ok(Self {
            redis: redis::Client::open(cfg.redis_url.as_str())?,
            request_list: cfg.request_list.clone(),
            response_prefix: cfg.response_prefix.clone(),
            timeout_secs: cfg.client_timeout_secs,
        })
    }

    /// Request the dense series for `[history_start, history_end]`
    /// (ISO-8601 UTC strings; `None` end means "until now").
    pub fn get_quotes(
        &self,
        source: &str,
        symbol: &str,
        timeframe: Timeframe,
        history_start: &str,
        history_end: Option<&str>,
    ) -> Result<BarSeries, QuotesError> {
        let request_id = Uuid::new_v4().to_string();
        let request = QuotesRequest {
            request_id: request_id.clone(),
            source: source.to_owned(),
            symbol: symbol.to_owned(),
            timeframe: timeframe.to_string(),
            history_start: history_start.to_owned(),
            history_end: history_end.map(str::to_owned),
        };

        let not_received = |reason: String| QuotesError::DataNotReceived {
            symbol: symbol.to_owned(),
            start: history_start.to_owned(),
            end: history_end.unwrap_or("now").to_owned(),
            reason,
        };

        let request_bytes = pack(&request)?;
        let mut conn = self.redis.get_connection()?;
        redis::cmd("LPUSH")
            .arg(&self.request_list)
            .arg(request_bytes)
            .query::<()>(&mut conn)?;
        debug!("Request {request_id} sent to {}", self.request_list);

        let slot = format!("{}:{}", self.response_prefix, request_id);
        let popped: Option<(String, Vec<u8>)> = redis::cmd("BRPOP")
            .arg(&slot)
            .arg(self.timeout_secs)
            .query(&mut conn)?;
        let Some((_, reply_bytes)) = popped else {
            return Err(not_received("reply timeout".into()));
        };

        let reply: QuotesReply = unpack(&reply_bytes)?;
        if reply.metadata.status == ReplyStatus::Error {
            let reason = reply
                .metadata
                .error
                .unwrap_or_else(|| "unspecified service error".into());
            return Err(not_received(reason));
        }

        let series = reply.into_series()?;
        debug!("Received {} bars for request {request_id}", series.len());
        Ok(series)
    }
}
