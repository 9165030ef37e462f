//! Integration tests for frame extraction under partial reads.

use inlinino::framer::{Chunk, Frame, Framer, FramingStrategy, DEFAULT_CEILING};
use inlinino::instruments::acs::{ACS_BUFFER_CEILING, REGISTRATION};
use inlinino::instruments::{InstrumentConfig, InstrumentStrategy};
use inlinino::instruments::generic::Generic;
use inlinino::record::Value;
use serde_json::json;

fn frames(chunks: Vec<Chunk>) -> Vec<Frame> {
    chunks
        .into_iter()
        .filter_map(|c| match c {
            Chunk::Frame(f) => Some(f),
            Chunk::Unknown(_) => None,
        })
        .collect()
}

fn generic() -> Generic {
    let record = json!({
        "module": "generic",
        "model": "GEN",
        "serial_number": "001",
        "log_path": "/tmp",
        "log_raw": false,
        "log_products": true,
        "separator": {"__bytes__": "ascii", "content": ","},
        "terminator": {"__bytes__": "ascii", "content": "\n"},
        "variable_names": ["x", "y"],
        "variable_units": ["1", "1"],
        "variable_precision": ["%d", "%d"],
        "variable_columns": [0, 1],
        "variable_types": ["int", "int"]
    });
    Generic::new(&InstrumentConfig::from_record(&record).unwrap()).unwrap()
}

#[test]
fn terminator_framer_basic() {
    let strategy = generic();
    let mut framer = Framer::new(strategy.framing(), DEFAULT_CEILING);
    framer.extend(b"1,2\n3,4\n5,6");
    let records: Vec<Vec<Value>> = frames(framer.extract())
        .iter()
        .map(|f| strategy.parse(f).unwrap().values)
        .collect();
    assert_eq!(
        records,
        vec![
            vec![Value::Int(1), Value::Int(2)],
            vec![Value::Int(3), Value::Int(4)],
        ]
    );
    assert_eq!(framer.buffered(), b"5,6");
}

#[test]
fn byte_by_byte_feed_only_emits_complete_frames() {
    let input = b"12,7\r\n-3,40\r\n9,9";
    let mut framer = Framer::new(FramingStrategy::Terminator(b"\r\n".to_vec()), 64);
    let mut emitted = Vec::new();
    for b in input {
        framer.extend(&[*b]);
        emitted.extend(frames(framer.extract()));
    }
    assert_eq!(emitted.len(), 2);

    // Frames joined by the terminator, then the residue, give back the input
    let mut rebuilt = Vec::new();
    for f in &emitted {
        rebuilt.extend_from_slice(&f.body);
        rebuilt.extend_from_slice(b"\r\n");
    }
    rebuilt.extend_from_slice(framer.buffered());
    assert_eq!(rebuilt, input);
}

#[test]
fn acs_style_binary_frame() {
    let payload: Vec<u8> = (0..84u8).collect();
    let mut stream = b"garbage".to_vec();
    stream.extend_from_slice(&REGISTRATION);
    stream.extend_from_slice(&payload);
    stream.extend_from_slice(&REGISTRATION);
    stream.extend_from_slice(&[1, 2, 3]);

    let mut framer = Framer::new(
        FramingStrategy::Registration {
            registration: REGISTRATION.to_vec(),
            length: payload.len(),
        },
        ACS_BUFFER_CEILING,
    );
    framer.extend(&stream);
    let chunks = framer.extract();
    assert_eq!(chunks[0], Chunk::Unknown(b"garbage".to_vec()));
    let emitted = frames(chunks);
    assert_eq!(emitted.len(), 1);
    assert_eq!(emitted[0].header, REGISTRATION);
    assert_eq!(emitted[0].body, payload);

    let mut residue = REGISTRATION.to_vec();
    residue.extend_from_slice(&[1, 2, 3]);
    assert_eq!(framer.buffered(), residue.as_slice());
}

#[test]
fn ceiling_discards_unframeable_bytes() {
    let mut framer = Framer::new(FramingStrategy::Terminator(b"\n".to_vec()), 16);
    framer.extend(&[b'x'; 10]);
    assert!(frames(framer.extract()).is_empty());
    assert!(!framer.enforce_ceiling());
    framer.extend(&[b'x'; 10]);
    assert!(framer.enforce_ceiling());
    assert!(framer.is_empty());
    framer.extend(b"1,2\n");
    assert_eq!(frames(framer.extract()).len(), 1);
}
