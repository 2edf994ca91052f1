//! Decoding ALERT2 IND traffic end to end.

use fieldlink::alert2::mant::{parse_rain_gauge, parse_self_report_pdu};
use fieldlink::alert2::{IndEvent, IndMessage, IndStream};
use fieldlink::stamp::NSEC_PER_SEC;

#[test]
fn rain_gauge_report_counts_tips() {
    // Sensor 0, one-byte accumulator 3, per-tip second offsets 0/1/2.
    let report = parse_rain_gauge(&[0x00, 0x11, 0x03, 0x00, 0x01, 0x02]).unwrap();
    let tuples: Vec<(u16, i64, i64)> = report
        .values
        .iter()
        .map(|value| (value.sensor_id, value.magnitude_int(), value.time_offset))
        .collect();
    assert_eq!(
        tuples,
        vec![
            (0, 1, 2 * NSEC_PER_SEC),
            (0, 2, NSEC_PER_SEC),
            (0, 3, 0),
        ]
    );
}

#[test]
fn mant_line_through_the_stream() {
    // A self-reporting MANT line whose payload is a general report:
    // control 0x00, report type 1 length 3, sensor 5 one-byte uint 9.
    let line = "N,2020,3,14,9,26,53.5,0,0,0,0,0,0,0,0,0,1,6,123,00 01 03 05 11 09\n";
    let mut stream = IndStream::new();
    let events = stream.on_data(line.as_bytes());
    let mant = events
        .iter()
        .find_map(|event| match event {
            IndEvent::Message(IndMessage::Mant(mant)) => Some(mant),
            _ => None,
        })
        .expect("MANT message");
    assert_eq!(mant.source_address, 123);
    let values: Vec<_> = mant.values().collect();
    assert_eq!(values.len(), 1);
    assert_eq!(values[0].sensor_id, 5);
    assert_eq!(values[0].magnitude_int(), 9);
    assert_eq!(mant.sensor_identifiers(), vec![5]);
}

#[test]
fn split_lines_reassemble_across_reads() {
    let line = "S,station=9,battery=12.6\n";
    let mut stream = IndStream::new();
    let (first, second) = line.as_bytes().split_at(10);
    assert!(stream.on_data(first).is_empty());
    let events = stream.on_data(second);
    assert!(events
        .iter()
        .any(|event| matches!(event, IndEvent::Message(IndMessage::Status(_)))));
}

#[test]
fn programmatic_pdu_round_trip() {
    // Build a PDU from sensor values of each numeric type, serialise,
    // and check the decode reproduces the tuples.
    struct Entry {
        sensor_id: u8,
        fl: u8,
        bytes: Vec<u8>,
        magnitude: i64,
    }
    let entries = vec![
        Entry { sensor_id: 1, fl: 0x11, bytes: vec![0x2A], magnitude: 42 },
        Entry { sensor_id: 2, fl: 0x12, bytes: vec![0x01, 0x00], magnitude: 256 },
        Entry { sensor_id: 3, fl: 0x22, bytes: vec![0xFF, 0x9C], magnitude: -100 },
        Entry { sensor_id: 4, fl: 0x34, bytes: 2.5f32.to_be_bytes().to_vec(), magnitude: 2 },
    ];
    let mut body = Vec::new();
    for entry in &entries {
        body.push(entry.sensor_id);
        body.push(entry.fl);
        body.extend_from_slice(&entry.bytes);
    }
    let mut pdu_bytes = vec![0x00, 0x01, body.len() as u8];
    pdu_bytes.extend_from_slice(&body);
    let pdu = parse_self_report_pdu(&pdu_bytes).unwrap();
    let values = &pdu.reports[0].values;
    assert_eq!(values.len(), entries.len());
    for (value, entry) in values.iter().zip(&entries) {
        assert_eq!(value.sensor_id, u16::from(entry.sensor_id));
        assert_eq!(value.magnitude_int(), entry.magnitude);
        assert_eq!(value.time_offset, 0);
    }
}

#[test]
fn bad_lines_do_not_stall_the_stream() {
    let mut stream = IndStream::new();
    let events = stream.on_data(b"N,garbage\nS,alive=1\n");
    let errors = events
        .iter()
        .filter(|event| matches!(event, IndEvent::Error { .. }))
        .count();
    let statuses = events
        .iter()
        .filter(|event| matches!(event, IndEvent::Message(IndMessage::Status(_))))
        .count();
    assert_eq!(errors, 1);
    assert_eq!(statuses, 1);
}
