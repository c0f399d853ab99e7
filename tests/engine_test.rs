use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use futuresbot::api::ScriptedFailure;
use futuresbot::clock::ClockError;
use futuresbot::gateway::GatewayError;
use futuresbot::indicators::IndicatorError;
use futuresbot::*;
use std::sync::Arc;
use std::time::Duration;
use tokio_test::{assert_err, assert_ok};

const SYMBOL: &str = "BTCUSDT";

fn test_settings() -> Settings {
    let mut settings = Settings::default();
    settings.retry.base_delay_ms = 1;
    settings.retry.max_delay_ms = 5;
    settings.retry.max_attempts = 3;
    settings.exchange.request_timeout_ms = 2_000;
    settings.risk.default_max_position_size = 10.0;
    settings
}

async fn engine_with(exchange: Arc<PaperExchange>, settings: Settings) -> TradingEngine {
    let engine = TradingEngine::new(exchange, settings);
    assert_ok!(engine.sync_clock().await);
    engine
}

fn bar_at(start: DateTime<Utc>, index: i64, close: f64) -> PriceBar {
    PriceBar {
        timestamp: start + ChronoDuration::hours(index),
        open: close,
        high: close,
        low: close,
        close,
        volume: 1.0,
    }
}

fn start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
}

#[tokio::test]
async fn test_resubmission_before_terminal_makes_one_exchange_call() {
    let paper = Arc::new(PaperExchange::new());
    let engine = Arc::new(engine_with(paper.clone(), test_settings()).await);

    let intent = OrderIntent::limit(SYMBOL, Side::Buy, 1.0, 90.0);

    let first = {
        let engine = engine.clone();
        let intent = intent.clone();
        tokio::spawn(async move { engine.submit_intent(intent).await })
    };
    let second = {
        let engine = engine.clone();
        let intent = intent.clone();
        tokio::spawn(async move { engine.submit_intent(intent).await })
    };

    let first = first.await.unwrap().unwrap();
    let second = second.await.unwrap().unwrap();

    assert_eq!(first, second);
    assert_eq!(first.state, OrderState::Acknowledged);
    assert_eq!(paper.calls().await.place_order, 1);

    // And once more, sequentially
    let third = engine.submit_intent(intent).await.unwrap();
    assert_eq!(third.client_request_id, first.client_request_id);
    assert_eq!(paper.calls().await.place_order, 1);
}

#[tokio::test]
async fn test_resubmission_after_fill_is_duplicate() {
    let paper = Arc::new(PaperExchange::new());
    paper.set_mark(SYMBOL, 100.0).await;
    let engine = engine_with(paper.clone(), test_settings()).await;

    let intent = OrderIntent::market(SYMBOL, Side::Buy, 1.0);
    let record = engine.submit_intent(intent.clone()).await.unwrap();
    assert_eq!(record.state, OrderState::Filled);

    let err = assert_err!(engine.submit_intent(intent).await);
    assert!(matches!(err, EngineError::DuplicateIntent { .. }));
    assert_eq!(paper.calls().await.place_order, 1);
}

#[tokio::test]
async fn test_indicator_history_and_sma20() {
    let engine = engine_with(Arc::new(PaperExchange::new()), test_settings()).await;
    let start = start_time();

    for i in 0..14 {
        let snapshot = engine.on_bar(SYMBOL, &bar_at(start, i, (i + 1) as f64)).await.unwrap();
        assert_eq!(snapshot.rsi14, None, "RSI must wait for enough history");
        assert_eq!(snapshot.sma20, None);
    }

    let mut last = None;
    for i in 14..20 {
        last = Some(engine.on_bar(SYMBOL, &bar_at(start, i, (i + 1) as f64)).await.unwrap());
    }
    let snapshot = last.unwrap();

    // Mean of closes 1..=20
    assert!((snapshot.sma20.unwrap() - 10.5).abs() < 1e-9);
    assert_eq!(snapshot.sma50, None);
    // Only gains so far
    assert_eq!(snapshot.rsi14, Some(100.0));
    assert_eq!(snapshot.as_of_bar_timestamp, Some(start + ChronoDuration::hours(19)));
}

#[tokio::test]
async fn test_out_of_order_bar_leaves_windows_unchanged() {
    let engine = engine_with(Arc::new(PaperExchange::new()), test_settings()).await;
    let start = start_time();

    for i in 0..25 {
        engine.on_bar(SYMBOL, &bar_at(start, i, 100.0 + i as f64)).await.unwrap();
    }
    let before = engine.indicator_snapshot(SYMBOL).await.unwrap();

    let duplicate = engine.on_bar(SYMBOL, &bar_at(start, 24, 1_000.0)).await;
    assert!(matches!(
        duplicate,
        Err(EngineError::Indicator(IndicatorError::OutOfOrderBar { .. }))
    ));
    let older = engine.on_bar(SYMBOL, &bar_at(start, 3, 1_000.0)).await;
    assert!(older.is_err());

    assert_eq!(engine.indicator_snapshot(SYMBOL).await.unwrap(), before);

    // The next in-order bar still lands on the old windows
    let next = engine.on_bar(SYMBOL, &bar_at(start, 25, 125.0)).await.unwrap();
    let expected: f64 = (106..=125).map(|c| c as f64).sum::<f64>() / 20.0;
    assert!((next.sma20.unwrap() - expected).abs() < 1e-9);
}

#[tokio::test]
async fn test_polling_market_data_feeds_indicators() {
    let paper = Arc::new(PaperExchange::new());
    let start = start_time();
    let bars: Vec<PriceBar> = (0..60).map(|i| bar_at(start, i, 100.0)).collect();
    paper.push_bars(SYMBOL, bars).await;
    paper.set_mark(SYMBOL, 100.0).await;

    let engine = engine_with(paper.clone(), test_settings()).await;
    assert_eq!(assert_ok!(engine.poll_market_data("btcusdt").await), None);

    let snapshot = engine.indicator_snapshot(SYMBOL).await.unwrap();
    assert_eq!(snapshot.sma20, Some(100.0));
    assert_eq!(snapshot.sma50, Some(100.0));
    assert_eq!(snapshot.rsi14, Some(50.0));

    // Polling again with no new bars changes nothing
    engine.poll_market_data(SYMBOL).await.unwrap();
    assert_eq!(engine.indicator_snapshot(SYMBOL).await.unwrap(), snapshot);
}

#[tokio::test]
async fn test_stop_loss_emits_exactly_one_exit() {
    let paper = Arc::new(PaperExchange::new());
    paper.set_position(SYMBOL, 2.0, 100.0).await;
    paper.set_mark(SYMBOL, 100.0).await;

    let engine = engine_with(paper.clone(), test_settings()).await;
    engine.reconcile().await.unwrap();
    engine
        .set_risk_rule(RiskRule::new(SYMBOL, 10.0).with_stop_loss(95.0))
        .await;

    paper.set_mark(SYMBOL, 94.0).await;
    let exit = engine.poll_market_data(SYMBOL).await.unwrap().unwrap();
    assert_eq!(exit.side, Side::Sell);
    assert_eq!(exit.quantity, 2.0);
    assert!(exit.reduce_only);
    assert_eq!(exit.state, OrderState::Filled);

    // Reconciliation has not confirmed flat yet
    paper.set_mark(SYMBOL, 93.0).await;
    assert_eq!(engine.poll_market_data(SYMBOL).await.unwrap(), None);
    assert_eq!(paper.calls().await.place_order, 1);

    engine.reconcile().await.unwrap();
    assert!(engine.list_positions().await.is_empty());
    assert_eq!(engine.poll_market_data(SYMBOL).await.unwrap(), None);
    assert_eq!(paper.calls().await.place_order, 1);
}

#[tokio::test]
async fn test_take_profit_on_short_from_default_percentage() {
    let paper = Arc::new(PaperExchange::new());
    paper.set_position(SYMBOL, -3.0, 200.0).await;
    paper.set_mark(SYMBOL, 200.0).await;

    let mut settings = test_settings();
    settings.risk.default_take_profit_pct = Some(0.05);
    let engine = engine_with(paper.clone(), settings).await;
    engine.reconcile().await.unwrap();

    paper.set_mark(SYMBOL, 195.0).await;
    assert_eq!(engine.poll_market_data(SYMBOL).await.unwrap(), None);

    paper.set_mark(SYMBOL, 189.0).await;
    let exit = engine.poll_market_data(SYMBOL).await.unwrap().unwrap();
    assert_eq!(exit.side, Side::Buy);
    assert_eq!(exit.quantity, 3.0);
}

#[tokio::test]
async fn test_pre_trade_rejection_makes_no_exchange_calls() {
    let paper = Arc::new(PaperExchange::new());
    paper.set_position(SYMBOL, 8.0, 100.0).await;
    paper.set_mark(SYMBOL, 100.0).await;

    let engine = engine_with(paper.clone(), test_settings()).await;
    engine.reconcile().await.unwrap();
    engine.set_risk_rule(RiskRule::new(SYMBOL, 10.0)).await;

    let calls_before = paper.calls().await;
    let intent = OrderIntent::market(SYMBOL, Side::Buy, 4.0);
    let err = engine.submit_intent(intent.clone()).await.unwrap_err();

    match err {
        EngineError::RiskRejected {
            symbol,
            client_request_id,
            ..
        } => {
            assert_eq!(symbol, SYMBOL);
            assert_eq!(client_request_id, intent.client_request_id);
        }
        other => panic!("expected a risk rejection, got {other:?}"),
    }
    assert_eq!(paper.calls().await, calls_before);
    assert!(engine.order(&intent.client_request_id).await.is_none());

    // Shrinking the position is always allowed
    let sell = engine
        .submit_intent(OrderIntent::market(SYMBOL, Side::Sell, 4.0))
        .await
        .unwrap();
    assert_eq!(sell.state, OrderState::Filled);
}

#[tokio::test]
async fn test_exhausted_retries_then_reconciliation_corrects_record() {
    let paper = Arc::new(PaperExchange::new().with_idempotency_keys(true));
    let mut settings = test_settings();
    settings.exchange.honors_idempotency_keys = true;
    let engine = engine_with(paper.clone(), settings).await;

    // Two clean failures, then the last attempt lands but its answer is lost
    paper
        .fail_next_place(ScriptedFailure::Fail(ExchangeError::transient("connection reset")))
        .await;
    paper
        .fail_next_place(ScriptedFailure::Fail(ExchangeError::transient("connection reset")))
        .await;
    paper.fail_next_place(ScriptedFailure::ExecuteThenTimeout).await;

    let intent = OrderIntent::limit(SYMBOL, Side::Buy, 1.0, 90.0);
    let err = engine.submit_intent(intent.clone()).await.unwrap_err();
    assert!(matches!(
        err,
        EngineError::SubmissionFailed {
            source: GatewayError::NetworkTransient { attempts: 3, .. },
            ..
        }
    ));
    assert!(err.outcome_unknown());
    assert_eq!(paper.calls().await.place_order, 3);

    let record = engine.order(&intent.client_request_id).await.unwrap();
    assert_eq!(record.state, OrderState::Rejected(RejectReason::SubmissionFailed));

    // New submissions on the symbol wait for reconciliation
    let blocked = engine
        .submit_intent(OrderIntent::limit(SYMBOL, Side::Buy, 1.0, 80.0))
        .await
        .unwrap_err();
    assert!(matches!(blocked, EngineError::ReconciliationRequired { .. }));

    let report = engine.reconcile().await.unwrap();
    assert_eq!(report.mismatches.len(), 1);
    assert_eq!(
        report.mismatches[0].from,
        OrderState::Rejected(RejectReason::SubmissionFailed)
    );
    assert_eq!(report.mismatches[0].to, OrderState::Acknowledged);

    let record = engine.order(&intent.client_request_id).await.unwrap();
    assert_eq!(record.state, OrderState::Acknowledged);
    assert!(record.exchange_order_id.is_some());

    assert_ok!(
        engine
            .submit_intent(OrderIntent::limit(SYMBOL, Side::Buy, 1.0, 80.0))
            .await
    );
}

#[tokio::test]
async fn test_ambiguous_failure_without_idempotency_keys_is_not_retried() {
    let paper = Arc::new(PaperExchange::new().with_idempotency_keys(false));
    let engine = engine_with(paper.clone(), test_settings()).await;

    paper.fail_next_place(ScriptedFailure::ExecuteThenTimeout).await;
    let intent = OrderIntent::limit(SYMBOL, Side::Sell, 2.0, 120.0);
    let err = engine.submit_intent(intent.clone()).await.unwrap_err();

    assert!(matches!(
        err,
        EngineError::SubmissionFailed {
            source: GatewayError::AmbiguousMutation { .. },
            ..
        }
    ));
    // A blind retry could have doubled the order
    assert_eq!(paper.calls().await.place_order, 1);
    assert_eq!(paper.orders().await.len(), 1);

    let report = engine.reconcile().await.unwrap();
    assert_eq!(report.mismatches.len(), 1);
    assert!(report.orphaned.is_empty());
    assert_eq!(
        engine.order(&intent.client_request_id).await.unwrap().state,
        OrderState::Acknowledged
    );
}

#[tokio::test]
async fn test_undelivered_failure_reconciles_to_confirmed_rejection() {
    let paper = Arc::new(PaperExchange::new());
    let mut settings = test_settings();
    settings.retry.max_attempts = 2;
    let engine = engine_with(paper.clone(), settings).await;

    for _ in 0..2 {
        paper
            .fail_next_place(ScriptedFailure::Fail(ExchangeError::undelivered("connection refused")))
            .await;
    }

    let intent = OrderIntent::limit(SYMBOL, Side::Buy, 1.0, 90.0);
    assert_err!(engine.submit_intent(intent.clone()).await);

    let report = engine.reconcile().await.unwrap();
    assert!(report.mismatches.is_empty());
    assert_eq!(
        engine.order(&intent.client_request_id).await.unwrap().state,
        OrderState::Rejected(RejectReason::SubmissionFailed)
    );
    // Verified, so the symbol is open again
    assert_ok!(
        engine
            .submit_intent(OrderIntent::limit(SYMBOL, Side::Buy, 1.0, 90.0))
            .await
    );
}

#[tokio::test]
async fn test_reconciliation_picks_up_fills() {
    let paper = Arc::new(PaperExchange::new());
    let engine = engine_with(paper.clone(), test_settings()).await;

    let record = engine
        .submit_intent(OrderIntent::limit(SYMBOL, Side::Buy, 4.0, 95.0))
        .await
        .unwrap();
    let exchange_order_id = record.exchange_order_id.clone().unwrap();

    paper.fill_order(&exchange_order_id, 1.5, 95.0).await.unwrap();
    let report = engine.reconcile().await.unwrap();
    assert_eq!(report.fills_observed, 1);
    let partial = engine.order(&record.client_request_id).await.unwrap();
    assert_eq!(partial.state, OrderState::PartiallyFilled);
    assert_eq!(partial.filled_quantity, 1.5);

    let positions = engine.list_positions().await;
    assert_eq!(positions.len(), 1);
    assert_eq!(positions[0].net_quantity, 1.5);

    let cancelled = engine.cancel_intent(&record.client_request_id).await.unwrap();
    assert_eq!(cancelled.state, OrderState::Cancelled);

    // Terminal: cancelling again is a no-op
    let again = engine.cancel_intent(&record.client_request_id).await.unwrap();
    assert_eq!(again.state, OrderState::Cancelled);
    assert_eq!(paper.calls().await.cancel_order, 1);
}

#[tokio::test]
async fn test_clock_rejects_slow_sample_and_keeps_offset() {
    let paper = Arc::new(PaperExchange::new().with_server_skew_ms(-2_000));
    let mut settings = test_settings();
    settings.clock.max_round_trip_ms = 500;
    let engine = engine_with(paper, settings).await;

    let good = engine.clock_status().await.offset.unwrap();
    assert!((good.offset_ms - 2_000).abs() < 250);

    let clock = engine.gateway().clock();
    let sent = Utc::now().timestamp_millis();
    let err = clock.apply_sample(sent, sent + 900, sent + 30_000).await.unwrap_err();
    assert_eq!(
        err,
        ClockError::LatencyTooHigh {
            round_trip_ms: 900,
            max_ms: 500
        }
    );

    let status = engine.clock_status().await;
    assert_eq!(status.offset, Some(good));
    assert!(!status.stale);
}

#[tokio::test]
async fn test_unsynced_clock_blocks_orders_but_not_reconciliation() {
    let paper = Arc::new(PaperExchange::new().with_server_latency(Duration::from_millis(600)));
    paper.set_position(SYMBOL, 1.0, 100.0).await;
    let mut settings = test_settings();
    settings.clock.max_round_trip_ms = 500;
    let engine = TradingEngine::new(paper.clone(), settings);

    let err = engine.sync_clock().await.unwrap_err();
    assert!(matches!(
        err,
        EngineError::Clock(ClockError::LatencyTooHigh { max_ms: 500, .. })
    ));
    assert!(engine.clock_status().await.stale);

    let err = engine
        .submit_intent(OrderIntent::limit(SYMBOL, Side::Buy, 1.0, 90.0))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::Order {
            source: GatewayError::ClockUnsynced { .. },
            ..
        }
    ));
    assert_eq!(paper.calls().await.place_order, 0);

    assert_ok!(engine.reconcile().await);
    assert_eq!(engine.list_positions().await.len(), 1);
}

#[tokio::test]
async fn test_rejected_cancel_is_surfaced_with_context() {
    let paper = Arc::new(PaperExchange::new());
    let engine = engine_with(paper.clone(), test_settings()).await;

    let record = engine
        .submit_intent(OrderIntent::limit(SYMBOL, Side::Sell, 1.0, 150.0))
        .await
        .unwrap();
    paper
        .fail_next_cancel(ScriptedFailure::Fail(ExchangeError::Rejected {
            code: -2011,
            message: "Unknown order sent.".to_string(),
        }))
        .await;

    let err = engine.cancel_intent(&record.client_request_id).await.unwrap_err();
    match err {
        EngineError::Order {
            symbol,
            client_request_id,
            source: GatewayError::ExchangeRejected { code, .. },
        } => {
            assert_eq!(symbol, SYMBOL);
            assert_eq!(client_request_id, record.client_request_id);
            assert_eq!(code, -2011);
        }
        other => panic!("expected an exchange rejection, got {other:?}"),
    }
    assert_eq!(
        engine.order(&record.client_request_id).await.unwrap().state,
        OrderState::Acknowledged
    );

    // The order is still live; a second attempt goes through
    let cancelled = engine.cancel_intent(&record.client_request_id).await.unwrap();
    assert_eq!(cancelled.state, OrderState::Cancelled);
}

#[tokio::test]
async fn test_balances_pass_through() {
    let paper = Arc::new(PaperExchange::new());
    paper.set_balance("USDT", 1_000.0).await;
    let engine = engine_with(paper, test_settings()).await;

    let balances = engine.balances().await.unwrap();
    assert_eq!(balances.len(), 1);
    assert_eq!(balances[0].asset, "USDT");
    assert_eq!(balances[0].available_balance, 1_000.0);
}
