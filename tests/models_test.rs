//! Deserialization tests for feed frames and REST responses, and
//! serialization of outbound feed control messages.

mod common;

use rust_decimal_macros::dec;

use stockpulse::models::aggs::{AggregatesResponse, MarketStatus, MarketStatusResponse};
use stockpulse::models::feed::FeedMessage;
use stockpulse::models::{FeedRequest, Granularity, UpdateTime, aggregate_channel};
use stockpulse::series::SeriesStore;
use stockpulse::websocket::parse_feed_text;

use common::{AGGREGATE_FRAME_JSON, AGGS_ERROR_JSON, AGGS_HISTORY_JSON, MARKET_STATUS_JSON};

#[test]
fn test_aggregate_frame_parses_every_event() {
    let messages = parse_feed_text(AGGREGATE_FRAME_JSON);
    assert_eq!(messages.len(), 4);

    match &messages[0] {
        FeedMessage::Status(status) => {
            assert_eq!(status.status, "auth_success");
            assert_eq!(status.message, "authenticated");
        }
        other => panic!("expected status, got {other:?}"),
    }
    assert!(matches!(messages[3], FeedMessage::Other));
}

#[test]
fn test_minute_aggregate_becomes_update_for_requested_granularity() {
    let aggregate = parse_feed_text(AGGREGATE_FRAME_JSON)
        .into_iter()
        .find_map(|message| match message {
            FeedMessage::MinuteAggregate(aggregate) => Some(aggregate),
            _ => None,
        })
        .expect("frame has a minute aggregate");

    assert_eq!(aggregate.sym, "AAPL");
    assert_eq!(aggregate.v, Some(dec!(4110)));
    assert_eq!(aggregate.e, Some(1_705_329_060_000));

    let update = aggregate.into_update(Granularity::Min5);
    assert_eq!(update.granularity, Granularity::Min5);
    assert_eq!(update.time, UpdateTime::Epoch(1_705_329_000_000));

    let tick = update.to_tick().expect("complete aggregate");
    assert_eq!(tick.time, 1_705_329_000);
    assert_eq!(tick.open, dec!(185.12));
    assert_eq!(tick.high, dec!(185.31));
    assert_eq!(tick.low, dec!(185.05));
    assert_eq!(tick.close, dec!(185.2));
}

#[test]
fn test_history_response_is_sorted_and_deduplicated_on_ingest() {
    let response: AggregatesResponse =
        serde_json::from_str(AGGS_HISTORY_JSON).expect("Failed to deserialize aggregates");

    assert_eq!(response.status.as_deref(), Some("OK"));
    assert_eq!(response.ticker.as_deref(), Some("AAPL"));
    assert_eq!(response.results.len(), 5);
    assert!(response.error.is_none());

    let candles: Vec<_> = response
        .results
        .iter()
        .filter_map(|bar| bar.to_candle(Granularity::Min1))
        .collect();
    // The last bar has no close and never reaches the store.
    assert_eq!(candles.len(), 4);

    let mut store = SeriesStore::new(Granularity::Min1);
    assert_eq!(store.merge_range(candles), 3);

    let times: Vec<i64> = store.snapshot().iter().map(|c| c.time).collect();
    assert_eq!(times, vec![1_705_329_000, 1_705_329_060, 1_705_329_120]);
    assert_eq!(store.earliest().unwrap().open, dec!(185.12));
}

#[test]
fn test_history_bars_align_to_coarser_buckets() {
    let response: AggregatesResponse = serde_json::from_str(AGGS_HISTORY_JSON).unwrap();
    let candle = response.results[0]
        .to_candle(Granularity::Min30)
        .expect("complete bar");
    assert_eq!(candle.time, 1_705_329_000);
}

#[test]
fn test_history_error_payload_deserializes() {
    let response: AggregatesResponse =
        serde_json::from_str(AGGS_ERROR_JSON).expect("Failed to deserialize error payload");

    assert_eq!(response.status.as_deref(), Some("ERROR"));
    assert_eq!(response.error.as_deref(), Some("Unknown API Key"));
    assert!(response.results.is_empty());
}

#[test]
fn test_market_status_deserializes() {
    let response: MarketStatusResponse =
        serde_json::from_str(MARKET_STATUS_JSON).expect("Failed to deserialize market status");

    assert_eq!(response.market, MarketStatus::ExtendedHours);
    assert!(!response.market.is_closed());
    assert_eq!(
        response.server_time.as_deref(),
        Some("2024-01-15T08:12:44-05:00")
    );

    let closed: MarketStatusResponse = serde_json::from_str(r#"{"market":"closed"}"#).unwrap();
    assert!(closed.market.is_closed());
}

#[test]
fn test_aggregate_channel_is_uppercased() {
    assert_eq!(aggregate_channel("aapl"), "AM.AAPL");
}

#[test]
fn test_auth_request_serializes() {
    let value = serde_json::to_value(FeedRequest::auth("secret")).unwrap();
    assert_eq!(value["action"], "auth");
    assert_eq!(value["params"], "secret");
}

#[test]
fn test_subscribe_request_joins_channels() {
    let symbols = vec!["AAPL".to_string(), "msft".to_string()];
    let value = serde_json::to_value(FeedRequest::subscribe(&symbols)).unwrap();
    assert_eq!(value["action"], "subscribe");
    assert_eq!(value["params"], "AM.AAPL,AM.MSFT");

    let value = serde_json::to_value(FeedRequest::unsubscribe(&symbols[..1])).unwrap();
    assert_eq!(value["action"], "unsubscribe");
    assert_eq!(value["params"], "AM.AAPL");
}

#[test]
fn test_ping_request_has_no_params() {
    let value = serde_json::to_value(FeedRequest::ping()).unwrap();
    assert_eq!(value["action"], "ping");
    assert!(value.get("params").is_none());
}

#[test]
fn test_granularity_round_trips_through_wire_names() {
    for granularity in Granularity::all() {
        let parsed: Granularity = granularity.as_str().parse().unwrap();
        assert_eq!(parsed, *granularity);
        let json = serde_json::to_string(granularity).unwrap();
        assert_eq!(json, format!("\"{granularity}\""));
    }
    assert!("2min".parse::<Granularity>().is_err());
}
