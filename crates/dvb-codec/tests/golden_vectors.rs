use dvb_codec::frame::{
    decode_frame, encode_frame, text_map, OP_READ, OP_WRITE, OP_WRITE_RSP,
};
use dvb_codec::Value;

fn to_hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{b:02x}"));
    }
    out
}

fn read_vector(name: &str) -> String {
    let path = format!("{}/tests/vectors/{name}", env!("CARGO_MANIFEST_DIR"));
    std::fs::read_to_string(path)
        .expect("vector file must exist")
        .trim()
        .to_string()
}

#[test]
fn os_reset_matches_golden_vector() {
    let frame = encode_frame(OP_WRITE, 0, 5, 0, None).expect("reset should encode");
    assert_eq!(to_hex(&frame), read_vector("os_reset.hex"));
}

#[test]
fn image_state_read_matches_golden_vector() {
    let frame = encode_frame(OP_READ, 1, 0, 7, None).expect("state read should encode");
    assert_eq!(to_hex(&frame), read_vector("image_state_read.hex"));
}

#[test]
fn os_echo_matches_golden_vector() {
    let body = text_map([("d", Value::Text("hi".to_string()))]);
    let frame = encode_frame(OP_WRITE, 0, 0, 1, Some(&body)).expect("echo should encode");
    assert_eq!(to_hex(&frame), read_vector("os_echo_hi.hex"));
}

#[test]
fn image_erase_with_empty_map_matches_golden_vector() {
    let body = Value::Map(Vec::new());
    let frame = encode_frame(OP_WRITE, 1, 5, 2, Some(&body)).expect("erase should encode");
    assert_eq!(to_hex(&frame), read_vector("image_erase.hex"));
}

#[test]
fn image_confirm_keeps_key_order() {
    let body = text_map([
        ("hash", Value::Bytes(vec![0x01, 0x02])),
        ("confirm", Value::Bool(true)),
    ]);
    let frame = encode_frame(OP_WRITE, 1, 0, 3, Some(&body)).expect("confirm should encode");
    assert_eq!(to_hex(&frame), read_vector("image_confirm.hex"));
}

#[test]
fn upload_ack_vector_decodes_to_offset() {
    let bytes = hex_decode(&read_vector("upload_ack_132.hex"));
    let frame = decode_frame(&bytes).expect("ack should decode");
    assert_eq!(frame.header.op, OP_WRITE_RSP);
    assert_eq!(frame.header.group, 1);
    assert_eq!(frame.header.id, 1);
    assert_eq!(frame.header.seq, 4);
    assert_eq!(frame.int_field("rc"), Some(0));
    assert_eq!(frame.int_field("off"), Some(132));
}

fn hex_decode(input: &str) -> Vec<u8> {
    (0..input.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&input[i..i + 2], 16).expect("vector should be hex"))
        .collect()
}
