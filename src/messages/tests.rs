use bytes::{BufMut, BytesMut};

use super::*;

#[test]
fn read_string_reads_up_to_nul() {
    let mut buf = BytesMut::new();
    buf.put_slice(b"hello\0world");
    let s = buf.read_string().unwrap();
    assert_eq!(s, "hello");
    assert_eq!(&buf[..], b"world");
}

#[test]
fn data_type_oids_match_postgres_catalog() {
    assert_eq!(i32::from(&DataType::Text), 25);
    assert_eq!(i32::from(&DataType::Int4), 23);
    assert_eq!(i32::from(&DataType::Bool), 16);
}

#[test]
fn parse_round_trips_through_bytes() {
    let parse = Parse {
        name: "stmt1".to_string(),
        query: "select 1".to_string(),
        param_types: vec![23],
    };
    let bytes: BytesMut = (&parse).try_into().unwrap();
    let parsed: Parse = (&bytes).try_into().unwrap();
    assert_eq!(parsed, parse);
}

#[test]
fn close_roundtrips_and_reports_prepared_statement() {
    let close = Close::new("stmt1");
    assert!(close.is_prepared_statement());
    assert!(!close.anonymous());

    let bytes: BytesMut = close.clone().try_into().unwrap();
    let parsed: Close = (&bytes).try_into().unwrap();
    assert_eq!(parsed.name, "stmt1");
    assert_eq!(parsed.target, 'S');
}

#[test]
fn close_complete_is_a_single_type3_message() {
    let msg = close_complete();
    assert_eq!(msg[0], b'3');
    assert_eq!(msg.len(), 5);
}
