/// driver.rs — Backtesting run loop
///
/// Loads the bar series, replays it through the broker and the strategy, and
/// keeps the outside world in sync: a result snapshot, a progress event and
/// a stop-flag poll every save period. Each bar first matches resting orders
/// against the bar's range, then hands the strategy the OHLCV prefix so it
/// can place new orders at the bar close.
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use tracing::{error, info, warn};

use quotes_service::client::QuotesClient;
use quotes_service::series::BarSeries;
use quotes_service::timeframe::Timeframe;
use quotes_service::timeutil::{ms_to_iso, parse_utc_ms};

use crate::broker::BacktestBroker;
use crate::config::EngineConfig;
use crate::publisher::ResultsPublisher;
use crate::strategy::{create_strategy, BarContext, StartContext, Strategy};
use crate::ta::TaProxy;
use crate::task::{BacktestingTask, MessageLevel, TaskEvent, TaskStore};

/// Marker for user-requested stops; lets the outer layers tell a CANCEL from
/// a genuine failure.
#[derive(Debug, thiserror::Error)]
#[error("backtesting was stopped by user request")]
pub struct Canceled;

/// Full connected run: fetch bars through the quotes service, publish
/// results onto the stream and honor the task's stop flag.
pub fn run_backtest(cfg: &EngineConfig, task: &BacktestingTask, result_id: &str) -> Result<()> {
    let strategy = create_strategy(&task.file_name)?;
    let timeframe: Timeframe = task
        .timeframe
        .parse()
        .with_context(|| format!("task {} timeframe", task.id))?;

    let client = QuotesClient::new(&cfg.quotes)?;
    info!(
        "Loading bars for {}:{}:{} from {} to {}",
        task.source, task.symbol, task.timeframe, task.date_start, task.date_end
    );
    let series = client.get_quotes(
        &task.source,
        &task.symbol,
        timeframe,
        &task.date_start,
        Some(&task.date_end),
    )?;
    info!("Received {} bars", series.len());

    let store = TaskStore::new(&cfg.redis_url, &cfg.tasks_prefix)?;
    let publisher = ResultsPublisher::new_redis(
        &cfg.redis_url,
        &cfg.results_stream_key(result_id),
        result_id,
    )?;

    run_with_series(
        task,
        result_id,
        strategy,
        &series,
        Duration::from_secs_f64(cfg.save_period_secs),
        Some(&store),
        Some(publisher),
    )
    .map(|_| ())
}

/// The run loop proper, decoupled from the bus: `store`/`publisher` are
/// `None` in standalone mode (tests, local experiments). Returns the broker
/// with the finished run for inspection.
pub fn run_with_series(
    task: &BacktestingTask,
    result_id: &str,
    mut strategy: Box<dyn Strategy>,
    series: &BarSeries,
    save_period: Duration,
    store: Option<&TaskStore>,
    mut publisher: Option<ResultsPublisher>,
) -> Result<BacktestBroker> {
    let date_start_ms = parse_utc_ms(&task.date_start).context("task dateStart")?;
    let date_end_ms = parse_utc_ms(&task.date_end).context("task dateEnd")?;
    if date_start_ms > date_end_ms {
        bail!(
            "task {}: dateStart {} is after dateEnd {}",
            task.id,
            task.date_start,
            task.date_end
        );
    }
    if series.is_empty() {
        bail!("no quotes data available for backtesting");
    }

    let mut broker = BacktestBroker::new(task)?;
    let mut ta = TaProxy::new(series);

    if let Some(store) = store {
        store.send_event(
            task.id,
            TaskEvent::BacktestingStarted {
                result_id: result_id.to_owned(),
            },
        )?;
    }
    if let Some(publisher) = publisher.as_mut() {
        publisher.reset(&broker)?;
    }

    strategy.on_start(&mut StartContext {
        parameters: &task.parameters,
        ta: &mut ta,
    })?;

    let result = run_bar_loop(
        task,
        result_id,
        &mut strategy,
        series,
        save_period,
        store,
        &mut publisher,
        &mut broker,
        &mut ta,
        date_start_ms,
        date_end_ms,
    );

    match result {
        Ok(()) => {
            info!(
                "Backtest finished: {} trades, {} deals",
                broker.trades.len(),
                broker.deals.len()
            );
            Ok(broker)
        }
        Err(e) => {
            if e.downcast_ref::<Canceled>().is_none() {
                // CANCEL was already emitted on the stop path; everything
                // else gets a terminal ERROR marker.
                if let Some(publisher) = publisher.as_mut() {
                    publisher.send_error_packet(&e.to_string(), None);
                }
                if let Some(store) = store {
                    if let Err(send_err) =
                        store.send_message(task.id, MessageLevel::Error, &e.to_string())
                    {
                        error!("Failed to report error on control channel: {send_err}");
                    }
                    if let Err(send_err) = store.send_event(
                        task.id,
                        TaskEvent::BacktestingError {
                            result_id: result_id.to_owned(),
                            message: e.to_string(),
                        },
                    ) {
                        error!("Failed to emit error event: {send_err}");
                    }
                }
            }
            Err(e)
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn run_bar_loop(
    task: &BacktestingTask,
    result_id: &str,
    strategy: &mut Box<dyn Strategy>,
    series: &BarSeries,
    save_period: Duration,
    store: Option<&TaskStore>,
    publisher: &mut Option<ResultsPublisher>,
    broker: &mut BacktestBroker,
    ta: &mut TaProxy,
    date_start_ms: i64,
    date_end_ms: i64,
) -> Result<()> {
    let mut last_update = Instant::now();

    for i in 0..series.len() {
        broker.set_bar(i, series.time[i], series.close[i]);

        // Resting orders see the bar before the strategy does, so fills land
        // before the strategy gets a chance to cancel or replace them.
        broker.match_bar(series.high[i], series.low[i])?;

        let bar = BarContext {
            index: i,
            time: series.time[i],
            price: series.close[i],
            times: &series.time[..=i],
            open: &series.open[..=i],
            high: &series.high[..=i],
            low: &series.low[..=i],
            close: &series.close[..=i],
            volume: &series.volume[..=i],
            equity_usd: broker.equity_usd,
            equity_symbol: broker.equity_symbol,
            store,
            task_id: task.id,
        };
        strategy.on_bar(broker, ta, &bar)?;

        if last_update.elapsed() >= save_period {
            update_state(
                broker,
                task,
                result_id,
                date_start_ms,
                date_end_ms,
                store,
                publisher,
                false,
            )?;
            last_update = Instant::now();
        }
    }

    // Close out and audit.
    broker.close_deals()?;
    if !broker.is_zero_amount(broker.equity_symbol) {
        bail!(
            "equity_symbol is {} after closing all deals",
            broker.equity_symbol
        );
    }
    if !broker.active_deals.is_empty() {
        bail!("active deals remain after close-out: {:?}", broker.active_deals);
    }
    if cfg!(debug_assertions) {
        let errors = broker.check_trading_results();
        if !errors.is_empty() {
            bail!("trading results validation failed:\n{}", errors.join("\n"));
        }
    }

    strategy.on_finish(broker)?;

    // Final snapshot at 100% progress, then the END marker.
    broker.current_time = Some(date_end_ms);
    update_state(
        broker,
        task,
        result_id,
        date_start_ms,
        date_end_ms,
        store,
        publisher,
        true,
    )?;
    if let Some(store) = store {
        store.send_event(
            task.id,
            TaskEvent::BacktestingCompleted {
                result_id: result_id.to_owned(),
            },
        )?;
    }
    Ok(())
}

/// Save-period housekeeping: refresh derived stats, push a snapshot, emit a
/// progress event, and poll the task for the stop flag and the duplicate-
/// worker witness.
#[allow(clippy::too_many_arguments)]
fn update_state(
    broker: &mut BacktestBroker,
    task: &BacktestingTask,
    result_id: &str,
    date_start_ms: i64,
    date_end_ms: i64,
    store: Option<&TaskStore>,
    publisher: &mut Option<ResultsPublisher>,
    is_finish: bool,
) -> Result<()> {
    let now = broker.current_time.unwrap_or(date_start_ms);
    let total = (date_end_ms - date_start_ms).max(1) as f64;
    let progress = ((now - date_start_ms) as f64 / total * 100.0).clamp(0.0, 100.0);
    broker.progress = (progress * 10.0).round() / 10.0;
    broker.stats.calc_stat();

    if let Some(publisher) = publisher.as_mut() {
        publisher.send_changes(broker)?;
        if is_finish {
            publisher.finish(broker)?;
        }
    }

    let Some(store) = store else {
        return Ok(());
    };

    store.send_event(
        task.id,
        TaskEvent::BacktestingProgress {
            result_id: result_id.to_owned(),
            progress: broker.progress,
            date_start: ms_to_iso(date_start_ms),
            current_time: ms_to_iso(now),
        },
    )?;

    let Some(current) = store.load(task.id)? else {
        warn!("Task {} not found during state update", task.id);
        return Ok(());
    };

    // Another worker stamped the task after us: stand down.
    if current.result_id != result_id {
        let message = format!(
            "another backtesting worker is running for this task \
             (expected result_id: {}, got: {result_id})",
            current.result_id
        );
        error!("Task {}: {message}", task.id);
        if let Some(publisher) = publisher.as_mut() {
            publisher.send_error_packet(&message, None);
        }
        store.send_message(task.id, MessageLevel::Error, &message)?;
        store.send_event(
            task.id,
            TaskEvent::BacktestingError {
                result_id: result_id.to_owned(),
                message: message.clone(),
            },
        )?;
        bail!(message);
    }

    if !current.is_running {
        let message = Canceled.to_string();
        info!("Task {} stopped: {message}", task.id);
        if let Some(publisher) = publisher.as_mut() {
            publisher.send_cancel_packet(&message);
        }
        store.send_message(task.id, MessageLevel::Warning, &message)?;
        store.send_event(
            task.id,
            TaskEvent::BacktestingError {
                result_id: result_id.to_owned(),
                message,
            },
        )?;
        return Err(Canceled.into());
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use crate::publisher::{GrowingSource, PacketSink, PacketType};
    use quotes_service::series::Bar;

    const H1: i64 = 3_600_000;

    fn task() -> BacktestingTask {
        let mut task = BacktestingTask::new(1);
        task.file_name = "scripted".into();
        task.source = "binance".into();
        task.symbol = "BTC/USDT".into();
        task.timeframe = "1h".into();
        task.date_start = "1970-01-01T00:00:00".into();
        task.date_end = "1970-01-01T03:00:00".into();
        task.fee_taker = 0.001;
        task.fee_maker = 0.0005;
        task.precision_amount = 0.001;
        task.precision_price = 0.01;
        task
    }

    fn series(closes: &[f64]) -> BarSeries {
        closes
            .iter()
            .enumerate()
            .map(|(i, &c)| Bar {
                time: i as i64 * H1,
                open: c,
                high: c + 1.0,
                low: c - 1.0,
                close: c,
                volume: 10.0,
            })
            .collect()
    }

    /// Buys on the first bar, sells double on the second (forcing a flip),
    /// and counts its lifecycle callbacks.
    struct Scripted {
        on_start_calls: Arc<AtomicUsize>,
        on_bar_calls: Arc<AtomicUsize>,
        on_finish_calls: Arc<AtomicUsize>,
    }

    impl Strategy for Scripted {
        fn on_start(&mut self, _ctx: &mut StartContext) -> Result<()> {
            self.on_start_calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn on_bar(
            &mut self,
            broker: &mut BacktestBroker,
            _ta: &mut TaProxy,
            bar: &BarContext,
        ) -> Result<()> {
            self.on_bar_calls.fetch_add(1, Ordering::SeqCst);
            match bar.index {
                0 => {
                    broker.buy(1.0, None, None)?;
                }
                1 => {
                    broker.sell(2.0, None, None)?;
                }
                _ => {}
            }
            Ok(())
        }

        fn on_finish(&mut self, _broker: &mut BacktestBroker) -> Result<()> {
            self.on_finish_calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn standalone_run_flips_and_closes_everything() {
        let on_start = Arc::new(AtomicUsize::new(0));
        let on_bar = Arc::new(AtomicUsize::new(0));
        let on_finish = Arc::new(AtomicUsize::new(0));
        let strategy = Box::new(Scripted {
            on_start_calls: Arc::clone(&on_start),
            on_bar_calls: Arc::clone(&on_bar),
            on_finish_calls: Arc::clone(&on_finish),
        });

        let broker = run_with_series(
            &task(),
            "result-1",
            strategy,
            &series(&[100.0, 101.0, 100.0]),
            Duration::from_secs(3600),
            None,
            None,
        )
        .unwrap();

        assert_eq!(on_start.load(Ordering::SeqCst), 1);
        assert_eq!(on_bar.load(Ordering::SeqCst), 3);
        assert_eq!(on_finish.load(Ordering::SeqCst), 1);

        // Flip produced two deals; close-out flattened the short.
        assert_eq!(broker.deals.len(), 2);
        assert!(broker.deals.iter().all(|d| d.is_closed));
        assert!(broker.is_zero_amount(broker.equity_symbol));
        // buy 1 + split sell (1+1) + close-out buy 1
        assert_eq!(broker.trades.len(), 4);
        assert_eq!(broker.progress, 100.0);
        assert!(broker.check_trading_results().is_empty());
    }

    #[test]
    fn misordered_dates_never_start() {
        let mut bad = task();
        bad.date_start = "1970-01-02T00:00:00".into();
        bad.date_end = "1970-01-01T00:00:00".into();
        let strategy = create_strategy("sma_cross").unwrap();
        let err = run_with_series(
            &bad,
            "result-1",
            strategy,
            &series(&[100.0, 101.0]),
            Duration::from_secs(1),
            None,
            None,
        )
        .unwrap_err();
        assert!(err.to_string().contains("dateStart"));
    }

    #[test]
    fn empty_series_is_an_error() {
        let strategy = create_strategy("sma_cross").unwrap();
        let err = run_with_series(
            &task(),
            "result-1",
            strategy,
            &BarSeries::new(),
            Duration::from_secs(1),
            None,
            None,
        )
        .unwrap_err();
        assert!(err.to_string().contains("no quotes data"));
    }

    #[derive(Default, Clone)]
    struct MemorySink {
        packets: Arc<Mutex<Vec<(PacketType, serde_json::Value)>>>,
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

    #[test]
    fn published_stream_is_start_data_end_with_growing_trades() {
        let sink = MemorySink::default();
        let publisher = ResultsPublisher::new(Box::new(sink.clone()), "result-9");
        let strategy = Box::new(Scripted {
            on_start_calls: Arc::new(AtomicUsize::new(0)),
            on_bar_calls: Arc::new(AtomicUsize::new(0)),
            on_finish_calls: Arc::new(AtomicUsize::new(0)),
        });

        run_with_series(
            &task(),
            "result-9",
            strategy,
            &series(&[100.0, 101.0, 100.0]),
            Duration::ZERO, // snapshot on every bar
            None,
            Some(publisher),
        )
        .unwrap();

        let packets = sink.packets.lock().unwrap();
        assert_eq!(packets.first().unwrap().0, PacketType::Start);
        assert_eq!(packets.last().unwrap().0, PacketType::End);
        assert!(packets[1..packets.len() - 1]
            .iter()
            .all(|(t, _)| *t == PacketType::Data));

        // Trade tails across all DATA packets reassemble the full list.
        let streamed: usize = packets
            .iter()
            .filter_map(|(_, data)| data.get("trades_new"))
            .filter_map(|v| v.as_array().map(Vec::len))
            .sum();
        assert_eq!(streamed, 4);
        // Every packet carries the result id.
        assert!(packets
            .iter()
            .all(|(_, data)| data["id_result"] == "result-9"));
    }

    #[test]
    fn sma_cross_runs_end_to_end() {
        // A wave: rally, dip, rally again. Crossovers both ways.
        let closes: Vec<f64> = (0..120)
            .map(|i| 100.0 + 10.0 * ((i as f64) * 0.12).sin())
            .collect();
        let mut sma_task = task();
        sma_task.file_name = "sma_cross".into();
        sma_task.date_end = "1970-01-05T23:00:00".into();
        sma_task
            .parameters
            .insert("fast".into(), serde_json::Value::from(5.0));
        sma_task
            .parameters
            .insert("slow".into(), serde_json::Value::from(12.0));

        let strategy = create_strategy("sma_cross").unwrap();
        let broker = run_with_series(
            &sma_task,
            "result-2",
            strategy,
            &series(&closes),
            Duration::from_secs(3600),
            None,
            None,
        )
        .unwrap();

        assert!(!broker.trades.is_empty());
        assert!(broker.deals.iter().all(|d| d.is_closed));
        assert!(broker.is_zero_amount(broker.equity_symbol));
        assert_eq!(broker.stats.total_trades as usize, broker.trades.len());
    }

    #[test]
    fn broker_view_exposes_tracked_properties() {
        let broker = BacktestBroker::new(&task()).unwrap();
        assert!(broker.property_names().contains(&"trades"));
        assert_eq!(broker.list_len("trades"), Some(0));
        assert!(broker.scalar("progress").is_some());
        assert!(broker.scalar("trades").is_none());
        assert!(broker.list_len("progress").is_none());
    }
}
