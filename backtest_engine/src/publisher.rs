/// publisher.rs — Incremental result publishing over an append-only stream
///
/// The publisher wraps a source object exposing a fixed set of tracked
/// properties. Scalars are snapshotted in full on every DATA packet; growing
/// lists send only the tail appended since the previous snapshot, so
/// downstream readers can consume incrementally and resume from any stream
/// id. Packet order per run: `START, (DATA)*, (END | ERROR | CANCEL)`.
use std::collections::BTreeMap;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PacketType {
    Start,
    Data,
    End,
    Error,
    Cancel,
}

impl PacketType {
    pub fn as_str(self) -> &'static str {
        match self {
            PacketType::Start => "start",
            PacketType::Data => "data",
            PacketType::End => "end",
            PacketType::Error => "error",
            PacketType::Cancel => "cancel",
        }
    }
}

/// Read-side view over a source's tracked properties. A hand-written visitor
/// stands in for runtime reflection: each source declares its property names
/// once and answers scalar/list lookups by name.
pub trait GrowingSource {
    fn property_names(&self) -> &'static [&'static str];
    /// Current value of a scalar property; `None` when the name is a list or
    /// unknown.
    fn scalar(&self, name: &str) -> Option<Value>;
    /// Current length of a growing-list property; `None` when the name is
    /// not a list.
    fn list_len(&self, name: &str) -> Option<usize>;
    /// Serialized elements `[from..]` of a list property.
    fn list_tail(&self, name: &str, from: usize) -> Vec<Value>;
}

/// Destination for packets. Production writes XADD entries onto a Redis
/// stream; tests capture packets in memory.
pub trait PacketSink: Send {
    fn append(&mut self, packet_type: PacketType, data_json: &str) -> Result<()>;
}

pub struct RedisStreamSink {
    redis: redis::Client,
    stream_key: String,
}

impl RedisStreamSink {
    pub fn new(redis_url: &str, stream_key: &str) -> Result<Self> {
        Ok(Self {
            redis: redis::Client::open(redis_url).context("results stream redis client")?,
            stream_key: stream_key.to_owned(),
        })
    }
}

impl PacketSink for RedisStreamSink {
    fn append(&mut self, packet_type: PacketType, data_json: &str) -> Result<()> {
        let mut conn = self.redis.get_connection()?;
        let id: String = redis::cmd("XADD")
            .arg(&self.stream_key)
            .arg("*")
            .arg("type")
            .arg(packet_type.as_str())
            .arg("data")
            .arg(data_json)
            .query(&mut conn)?;
        debug!(
            "Sent {} packet to stream {} with id {id}",
            packet_type.as_str(),
            self.stream_key
        );
        Ok(())
    }
}

pub struct ResultsPublisher {
    sink: Box<dyn PacketSink>,
    result_id: String,
    simple_properties: Vec<String>,
    list_sizes: BTreeMap<String, usize>,
    initialized: bool,
}

impl ResultsPublisher {
    pub fn new(sink: Box<dyn PacketSink>, result_id: &str) -> Self {
        Self {
            sink,
            result_id: result_id.to_owned(),
            simple_properties: Vec::new(),
            list_sizes: BTreeMap::new(),
            initialized: false,
        }
    }

    pub fn new_redis(redis_url: &str, stream_key: &str, result_id: &str) -> Result<Self> {
        Ok(Self::new(
            Box::new(RedisStreamSink::new(redis_url, stream_key)?),
            result_id,
        ))
    }

    fn send_packet(&mut self, packet_type: PacketType, data: Option<Map<String, Value>>) -> Result<()> {
        let mut payload = data.unwrap_or_default();
        payload.insert("id_result".into(), Value::String(self.result_id.clone()));
        let json = serde_json::to_string(&Value::Object(payload))?;
        self.sink.append(packet_type, &json)
    }

    /// Classify each tracked property as scalar or growing list, record the
    /// initial list lengths, and emit the START marker.
    pub fn reset(&mut self, source: &dyn GrowingSource) -> Result<()> {
        self.simple_properties.clear();
        self.list_sizes.clear();

        for &name in source.property_names() {
            if let Some(len) = source.list_len(name) {
                self.list_sizes.insert(name.to_owned(), len);
                debug!("Property '{name}' is a list with size {len}");
            } else if source.scalar(name).is_some() {
                self.simple_properties.push(name.to_owned());
                debug!("Property '{name}' is a simple property");
            } else {
                error!("Property '{name}' not found in source object, skipping");
            }
        }

        self.send_packet(PacketType::Start, None)?;
        self.initialized = true;
        info!(
            "Publisher reset: {} simple properties, {} list properties",
            self.simple_properties.len(),
            self.list_sizes.len()
        );
        Ok(())
    }

    /// Emit a DATA packet with every scalar and the tail of every list that
    /// grew since the last call. No packet when nothing changed.
    pub fn send_changes(&mut self, source: &dyn GrowingSource) -> Result<()> {
        anyhow::ensure!(self.initialized, "reset() must be called before send_changes()");

        let mut data = Map::new();
        for name in &self.simple_properties {
            match source.scalar(name) {
                Some(value) => {
                    data.insert(name.clone(), value);
                }
                None => warn!("Property '{name}' not found, skipping"),
            }
        }

        for (name, last_size) in self.list_sizes.iter_mut() {
            let Some(current_size) = source.list_len(name) else {
                warn!("Property '{name}' is no longer a list, skipping");
                continue;
            };
            if current_size > *last_size {
                let tail = source.list_tail(name, *last_size);
                data.insert(format!("{name}_new"), Value::Array(tail));
                *last_size = current_size;
            } else if current_size < *last_size {
                warn!(
                    "Property '{name}': list size decreased from {last_size} to {current_size}, \
                     unexpected for a growing list"
                );
                *last_size = current_size;
            }
        }

        if data.is_empty() {
            debug!("No changes to send");
            return Ok(());
        }
        self.send_packet(PacketType::Data, Some(data))
    }

    /// Snapshot final list sizes and emit the END marker.
    pub fn finish(&mut self, source: &dyn GrowingSource) -> Result<()> {
        anyhow::ensure!(self.initialized, "reset() must be called before finish()");
        for (name, last_size) in self.list_sizes.iter_mut() {
            if let Some(len) = source.list_len(name) {
                *last_size = len;
            }
        }
        self.send_packet(PacketType::End, None)?;
        info!("Publisher finished. Final list sizes: {:?}", self.list_sizes);
        Ok(())
    }

    /// Terminal ERROR marker. Emission failures are logged, never raised, so
    /// the original error is not masked by a secondary one.
    pub fn send_error_packet(&mut self, message: &str, context: Option<Value>) {
        let mut data = Map::new();
        data.insert("message".into(), Value::String(message.to_owned()));
        if let Some(ctx) = context {
            data.insert("context".into(), ctx);
        }
        if let Err(e) = self.send_packet(PacketType::Error, Some(data)) {
            error!("Failed to send error packet: {e}");
        }
    }

    /// Terminal CANCEL marker for user-requested stops. Never raises.
    pub fn send_cancel_packet(&mut self, message: &str) {
        let mut data = Map::new();
        data.insert("message".into(), Value::String(message.to_owned()));
        if let Err(e) = self.send_packet(PacketType::Cancel, Some(data)) {
            error!("Failed to send cancel packet: {e}");
        }
    }
}

// ── Reader side ───────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct Packet {
    pub packet_type: String,
    pub data: Option<Value>,
}

/// Async consumer of one run's results stream.
pub struct ResultsReader {
    redis: redis::Client,
    stream_key: String,
}

impl ResultsReader {
    pub fn new(redis_url: &str, stream_key: &str) -> Result<Self> {
        Ok(Self {
            redis: redis::Client::open(redis_url).context("results reader redis client")?,
            stream_key: stream_key.to_owned(),
        })
    }

    /// Entries after `last_id` ("0-0" reads from the beginning), blocking up
    /// to `block_ms`. `None` means the wait timed out with no data.
    pub async fn read_from(
        &self,
        last_id: &str,
        block_ms: u64,
        count: usize,
    ) -> Result<Option<Vec<(String, Packet)>>> {
        let mut conn = self.redis.get_async_connection().await?;
        let mut cmd = redis::cmd("XREAD");
        if block_ms > 0 {
            cmd.arg("BLOCK").arg(block_ms);
        }
        cmd.arg("COUNT")
            .arg(count)
            .arg("STREAMS")
            .arg(&self.stream_key)
            .arg(last_id);

        let reply: Option<redis::streams::StreamReadReply> =
            cmd.query_async(&mut conn).await?;
        let Some(reply) = reply else {
            return Ok(None);
        };

        let mut parsed = Vec::new();
        for stream in reply.keys {
            for entry in stream.ids {
                let packet_type: String = entry
                    .get("type")
                    .unwrap_or_else(|| "unknown".to_owned());
                let data = entry.get::<String>("data").map(|raw| {
                    serde_json::from_str(&raw)
                        .unwrap_or_else(|_| serde_json::json!({ "raw": raw }))
                });
                parsed.push((entry.id.clone(), Packet { packet_type, data }));
            }
        }
        Ok((!parsed.is_empty()).then_some(parsed))
    }

    /// Drop entries older than `min_id`, bounding the stream by the slowest
    /// active reader.
    pub async fn trim_min_id(&self, min_id: &str) -> Result<()> {
        let mut conn = self.redis.get_async_connection().await?;
        redis::cmd("XTRIM")
            .arg(&self.stream_key)
            .arg("MINID")
            .arg(min_id)
            .query_async::<_, ()>(&mut conn)
            .await?;
        debug!("Trimmed stream {} to MINID {min_id}", self.stream_key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Default, Clone)]
    struct MemorySink {
        packets: Arc<Mutex<Vec<(PacketType, Value)>>>,
    }

    impl PacketSink for MemorySink {
        fn append(&mut self, packet_type: PacketType, data_json: &str) -> Result<()> {
            self.packets
                .lock()
                .unwrap()
                .push((packet_type, serde_json::from_str(data_json)?));
            Ok(())
        }
    }

    struct FakeRun {
        progress: f64,
        trades: Vec<Value>,
    }

    impl GrowingSource for FakeRun {
        fn property_names(&self) -> &'static [&'static str] {
            &["progress", "trades", "missing"]
        }

        fn scalar(&self, name: &str) -> Option<Value> {
            (name == "progress").then(|| Value::from(self.progress))
        }

        fn list_len(&self, name: &str) -> Option<usize> {
            (name == "trades").then_some(self.trades.len())
        }

        fn list_tail(&self, name: &str, from: usize) -> Vec<Value> {
            if name == "trades" {
                self.trades[from..].to_vec()
            } else {
                Vec::new()
            }
        }
    }

    fn publisher() -> (ResultsPublisher, MemorySink) {
        let sink = MemorySink::default();
        let publisher = ResultsPublisher::new(Box::new(sink.clone()), "run-1");
        (publisher, sink)
    }

    #[test]
    fn packet_order_is_start_data_end() {
        let (mut publisher, sink) = publisher();
        let mut run = FakeRun { progress: 0.0, trades: vec![Value::from(1)] };

        publisher.reset(&run).unwrap();
        run.progress = 50.0;
        run.trades.push(Value::from(2));
        publisher.send_changes(&run).unwrap();
        publisher.finish(&run).unwrap();

        let packets = sink.packets.lock().unwrap();
        let kinds: Vec<PacketType> = packets.iter().map(|(t, _)| *t).collect();
        assert_eq!(kinds, vec![PacketType::Start, PacketType::Data, PacketType::End]);
        // Every packet carries the run id.
        for (_, data) in packets.iter() {
            assert_eq!(data["id_result"], "run-1");
        }
    }

    #[test]
    fn growing_list_sends_only_the_tail() {
        let (mut publisher, sink) = publisher();
        let mut run = FakeRun {
            progress: 0.0,
            trades: vec![Value::from("a")],
        };
        publisher.reset(&run).unwrap();

        run.trades.push(Value::from("b"));
        run.trades.push(Value::from("c"));
        publisher.send_changes(&run).unwrap();

        let packets = sink.packets.lock().unwrap();
        let (_, data) = &packets[1];
        // Initial element was present before reset; only the two new ones go.
        assert_eq!(data["trades_new"], serde_json::json!(["b", "c"]));
        assert_eq!(data["progress"], 0.0);
    }

    #[test]
    fn unchanged_lists_are_omitted_and_sizes_are_monotonic() {
        let (mut publisher, sink) = publisher();
        let mut run = FakeRun { progress: 1.0, trades: vec![] };
        publisher.reset(&run).unwrap();

        publisher.send_changes(&run).unwrap();
        run.progress = 2.0;
        publisher.send_changes(&run).unwrap();

        let packets = sink.packets.lock().unwrap();
        // Scalars always present, list key absent while it never grew.
        for (_, data) in packets.iter().skip(1) {
            assert!(data.get("trades_new").is_none());
            assert!(data.get("progress").is_some());
        }
    }

    #[test]
    fn shrinking_list_warns_and_accepts_new_size() {
        let (mut publisher, sink) = publisher();
        let mut run = FakeRun {
            progress: 0.0,
            trades: vec![Value::from(1), Value::from(2)],
        };
        publisher.reset(&run).unwrap();

        run.trades.pop();
        publisher.send_changes(&run).unwrap();
        // Growing again from the shrunk size resumes tails from there.
        run.trades.push(Value::from(9));
        publisher.send_changes(&run).unwrap();

        let packets = sink.packets.lock().unwrap();
        assert!(packets[1].1.get("trades_new").is_none());
        assert_eq!(packets[2].1["trades_new"], serde_json::json!([9]));
    }

    #[test]
    fn error_and_cancel_packets_carry_messages() {
        let (mut publisher, sink) = publisher();
        let run = FakeRun { progress: 0.0, trades: vec![] };
        publisher.reset(&run).unwrap();
        publisher.send_error_packet("boom", Some(serde_json::json!({"bar": 7})));
        publisher.send_cancel_packet("stopped by user");

        let packets = sink.packets.lock().unwrap();
        assert_eq!(packets[1].0, PacketType::Error);
        assert_eq!(packets[1].1["message"], "boom");
        assert_eq!(packets[1].1["context"]["bar"], 7);
        assert_eq!(packets[2].0, PacketType::Cancel);
    }

    #[test]
    fn send_changes_requires_reset() {
        let (mut publisher, _) = publisher();
        let run = FakeRun { progress: 0.0, trades: vec![] };
        assert!(publisher.send_changes(&run).is_err());
    }
}
