//! Compiling user expressions into request sets.

use approx::assert_relative_eq;
use fieldlink::expression::token::Value;
use fieldlink::expression::TokenFactory;
use fieldlink::source::{OrderOption, StartOption};
use fieldlink::stamp::{Stamp, NSEC_PER_DAY};

#[test]
fn setup_functions_configure_every_request() {
    let factory = TokenFactory::new();
    let (mut handler, requests) = factory
        .make_expression(
            "StartRelativeToNewest(nsecPerWeek, OrderCollected); src:stn.tbl.v1 + src:stn.tbl.v2",
            None,
            OrderOption::RealTime,
        )
        .unwrap();

    // Exactly one request per data variable, each frozen with the
    // accumulated configuration.
    assert_eq!(requests.len(), 2);
    for request in &requests {
        let request = request.lock().unwrap();
        assert!(request.is_frozen());
        assert_eq!(request.start_option(), StartOption::RelativeToNewest);
        assert_eq!(request.backfill_interval(), 7 * NSEC_PER_DAY);
        assert_eq!(request.order_option(), OrderOption::Collected);
    }

    handler.assign_variable("src:stn.tbl.v1", Value::Float(3.0), Stamp::from_nanos(0));
    handler.assign_variable("src:stn.tbl.v2", Value::Float(4.0), Stamp::from_nanos(0));
    assert_relative_eq!(handler.evaluate().unwrap(), 7.0);
}

#[test]
fn default_order_applies_when_no_setup_runs() {
    let factory = TokenFactory::new();
    let (_, requests) = factory
        .make_expression("src:stn.tbl.v1 * 2", None, OrderOption::LoggedWithHoles)
        .unwrap();
    assert_eq!(requests.len(), 1);
    let request = requests[0].lock().unwrap();
    assert_eq!(request.order_option(), OrderOption::LoggedWithHoles);
    assert!(!request.is_frozen(), "nothing froze a bare request");
}

#[test]
fn start_at_time_uses_the_given_stamp() {
    let factory = TokenFactory::new();
    let start = Stamp::from_ymd_hms(2022, 7, 1, 0, 0, 0).unwrap();
    let expression = format!("StartAtTime({}); src:stn.tbl.v", start.nanos());
    let (_, requests) = factory
        .make_expression(&expression, None, OrderOption::RealTime)
        .unwrap();
    let request = requests[0].lock().unwrap();
    assert_eq!(request.start_option(), StartOption::AtTime);
    assert_eq!(request.start_time(), start);
}

#[test]
fn report_offset_rides_with_the_requests() {
    let factory = TokenFactory::new();
    let (_, requests) = factory
        .make_expression("ReportOffset(nsecPerHour); src:stn.tbl.v", None, OrderOption::RealTime)
        .unwrap();
    let request = requests[0].lock().unwrap();
    assert_eq!(request.report_offset(), fieldlink::stamp::NSEC_PER_HOUR);
}

#[test]
fn aggregates_track_values_across_record_arrivals() {
    let factory = TokenFactory::new();
    let (mut handler, requests) = factory
        .make_expression("AvgRun(src:stn.tbl.v, 3)", None, OrderOption::RealTime)
        .unwrap();
    assert_eq!(requests.len(), 1);
    let inputs = [2.0, 4.0, 6.0, 8.0];
    let expected = [2.0, 3.0, 4.0, 6.0];
    for (input, want) in inputs.iter().zip(expected) {
        handler.assign_variable("src:stn.tbl.v", Value::Float(*input), Stamp::from_nanos(0));
        assert_relative_eq!(handler.evaluate().unwrap(), want);
    }
}

#[test]
fn parse_errors_carry_offsets() {
    let factory = TokenFactory::new();
    let error = factory
        .make_expression("1 + $\"unterminated", None, OrderOption::RealTime)
        .unwrap_err();
    assert!(error.offset > 0);
}
