mod common;

use algo_engine::application::strategies::TwapAlgo;
use algo_engine::domain::params::{ParamMap, SecurityTuple};
use algo_engine::domain::repositories::RecordStatus;
use algo_engine::domain::types::{Confirmation, DataSrc, ExecType, MarketData, OrderSide};
use common::{user, wait_until, Harness};

fn twap_params(qty: f64) -> ParamMap {
    ParamMap::new()
        .with(
            "security",
            SecurityTuple {
                src: DataSrc::DEFAULT,
                sec: 11,
                acc: 4,
                side: OrderSide::Buy,
                qty,
            },
        )
        .with("duration_secs", 1)
        .with("slices", 2)
}

fn quote(bid: f64, ask: f64) -> MarketData {
    let mut md = MarketData::default();
    md.quote.bid_price = bid;
    md.quote.ask_price = ask;
    md.quote.bid_size = 100.0;
    md.quote.ask_size = 100.0;
    md
}

#[test]
fn test_twap_slices_until_filled() {
    let h = Harness::new(2);
    let params = twap_params(100.0);
    let raw = params.to_json().unwrap();
    let handle = h
        .manager
        .spawn(params, TwapAlgo::NAME, &user(), &raw, "twap-1")
        .unwrap();
    assert!(h.manager.is_subscribed(DataSrc::DEFAULT, 11));
    h.manager.update(DataSrc::DEFAULT, 11, quote(9.9, 10.1));

    // 1. First slice: half the target at the bid
    assert!(wait_until(|| h.execution.placed().len() == 1));
    let first = h.execution.placed().remove(0);
    assert_eq!(first.algo_id, handle.id());
    assert_eq!(first.contract.qty, 50.0);
    assert_eq!(first.contract.price, 9.9);
    assert_eq!(first.contract.sub_account, 4);
    h.manager.handle(Confirmation::new(first.id, ExecType::New));
    h.manager
        .handle(Confirmation::fill(first.id, 50.0, 9.9, true));

    // 2. Second slice: the remainder
    assert!(wait_until(|| h.execution.placed().len() == 2));
    let second = h.execution.placed().remove(1);
    assert_eq!(second.contract.qty, 50.0);
    h.manager
        .handle(Confirmation::fill(second.id, 50.0, 9.95, true));

    // 3. Target reached: the algo stops itself and the feed closes
    assert!(wait_until(|| !handle.is_active()));
    assert!(wait_until(|| h.manager.get_by_token("twap-1").is_none()));
    assert!(wait_until(|| !h.manager.is_subscribed(DataSrc::DEFAULT, 11)));
    assert_eq!(h.execution.placed().len(), 2);

    let records = h.store.records();
    let progress: Vec<_> = records
        .iter()
        .filter(|r| r.status == RecordStatus::Custom("progress".to_string()))
        .map(|r| r.body.as_str())
        .collect();
    assert_eq!(progress, vec!["50.0000/100.0000", "100.0000/100.0000"]);
    assert_eq!(records.last().unwrap().status, RecordStatus::Stopped);
}

#[test]
fn test_twap_without_prices_runs_out_of_slices() {
    let h = Harness::new(1);
    let params = twap_params(10.0);
    let raw = params.to_json().unwrap();
    let handle = h
        .manager
        .spawn(params, TwapAlgo::NAME, &user(), &raw, "twap-dry")
        .unwrap();

    assert!(wait_until(|| !handle.is_active()));
    assert!(h.execution.placed().is_empty());
    assert!(wait_until(|| !h.manager.is_subscribed(DataSrc::DEFAULT, 11)));
}

#[test]
fn test_twap_refuses_zero_quantity() {
    let h = Harness::new(1);
    let params = twap_params(0.0);
    let err = h
        .manager
        .spawn(params, TwapAlgo::NAME, &user(), "{}", "twap-zero")
        .unwrap_err();
    assert!(err.to_string().contains("quantity must be positive"), "got {}", err);
    assert!(!h.manager.is_subscribed(DataSrc::DEFAULT, 11));
}
