#![cfg(feature = "streaming")]

use fx_conductor::ens::frame::FrameDecoder;
use fx_conductor::error::EngineError;

/// Build one wire record: little-endian message id, two reserved bytes, the
/// reference id with its length prefix, the payload format byte, and the
/// length-prefixed payload.
fn record(message_id: u64, reference_id: &str, format: u8, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&message_id.to_le_bytes());
    out.extend_from_slice(&[0, 0]);
    out.push(u8::try_from(reference_id.len()).expect("short reference id"));
    out.extend_from_slice(reference_id.as_bytes());
    out.push(format);
    out.extend_from_slice(&u32::try_from(payload.len()).expect("short payload").to_le_bytes());
    out.extend_from_slice(payload);
    out
}

#[test]
fn decodes_a_single_record() {
    let mut decoder = FrameDecoder::new();

    let frames = decoder
        .decode(&record(7, "ens-abc123", 0, br#"{"Data":[]}"#))
        .expect("valid record");

    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].message_id, 7);
    assert_eq!(frames[0].reference_id, "ens-abc123");
    assert_eq!(frames[0].payload, br#"{"Data":[]}"#.to_vec());
    assert_eq!(decoder.pending(), 0);
}

#[test]
fn decodes_concatenated_records() {
    let mut decoder = FrameDecoder::new();

    let mut wire = record(1, "ens-a", 0, br"{}");
    wire.extend_from_slice(&record(2, "_heartbeat", 0, br"{}"));
    wire.extend_from_slice(&record(3, "ens-a", 0, br#"{"Data":[]}"#));

    let frames = decoder.decode(&wire).expect("valid records");

    assert_eq!(
        frames.iter().map(|f| f.message_id).collect::<Vec<_>>(),
        vec![1, 2, 3]
    );
    assert_eq!(frames[1].reference_id, "_heartbeat");
}

#[test]
fn retains_a_split_record_across_calls() {
    let mut decoder = FrameDecoder::new();

    let wire = record(42, "ens-a", 0, br#"{"Data":[{"ActivityType":"Orders"}]}"#);
    let (head, tail) = wire.split_at(wire.len() / 2);

    let frames = decoder.decode(head).expect("incomplete is not an error");
    assert!(frames.is_empty());
    assert_eq!(decoder.pending(), head.len());

    let frames = decoder.decode(tail).expect("completed record");
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].message_id, 42);
    assert_eq!(decoder.pending(), 0);
}

#[test]
fn split_point_inside_the_header_is_retained_too() {
    let mut decoder = FrameDecoder::new();

    let wire = record(9, "ens-a", 0, br"{}");
    let frames = decoder.decode(&wire[..5]).expect("incomplete header");
    assert!(frames.is_empty());

    let frames = decoder.decode(&wire[5..]).expect("completed record");
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].message_id, 9);
}

#[test]
fn non_json_payload_format_poisons_the_buffer() {
    let mut decoder = FrameDecoder::new();

    let mut wire = record(1, "ens-a", 2, br"{}");
    wire.extend_from_slice(&record(2, "ens-a", 0, br"{}"));

    let err = decoder.decode(&wire).expect_err("format 2 is unsupported");
    assert!(matches!(err, EngineError::PayloadFormat(2)));
    // Boundaries can no longer be trusted; everything was dropped.
    assert_eq!(decoder.pending(), 0);

    // The decoder keeps working on fresh input.
    let frames = decoder
        .decode(&record(3, "ens-a", 0, br"{}"))
        .expect("fresh record after poisoning");
    assert_eq!(frames.len(), 1);
}

#[test]
fn payload_parses_as_json() {
    let mut decoder = FrameDecoder::new();

    let frames = decoder
        .decode(&record(1, "ens-a", 0, br#"{"Data":[{"Uic":21}]}"#))
        .expect("valid record");
    let payload = frames[0].payload_json().expect("valid JSON");

    assert_eq!(payload["Data"][0]["Uic"], 21);
}
