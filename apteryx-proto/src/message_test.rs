use bytes::Bytes;

use super::message::Leaf;
use super::message::Reply;
use super::message::Request;
use super::message::SetOp;
use super::op::OpCode;
use super::op::Status;
use super::TS_UNCONDITIONAL;

fn roundtrip(req: Request) -> Request {
    Request::decode(req.encode()).expect("decode")
}

#[test]
fn set_roundtrip() {
    let req = Request::Set {
        ops: vec![
            SetOp {
                path: "/test/a/b".into(),
                value: Some(Bytes::from_static(b"1")),
                ts: 0,
            },
            SetOp {
                path: "/test/a/c".into(),
                value: None,
                ts: 42,
            },
        ],
        expected: TS_UNCONDITIONAL,
        wait: false,
    };
    assert_eq!(roundtrip(req.clone()), req);
}

#[test]
fn set_wait_selects_distinct_opcode() {
    let req = Request::Set {
        ops: vec![],
        expected: TS_UNCONDITIONAL,
        wait: true,
    };
    assert_eq!(req.opcode(), OpCode::SetWait);
    assert_eq!(roundtrip(req.clone()), req);
}

#[test]
fn values_are_binary_transparent() {
    let payload = Bytes::from_static(b"with\0embedded\0nuls");
    let req = Request::Set {
        ops: vec![SetOp {
            path: "/test/raw".into(),
            value: Some(payload.clone()),
            ts: 0,
        }],
        expected: TS_UNCONDITIONAL,
        wait: false,
    };
    match roundtrip(req) {
        Request::Set { ops, .. } => assert_eq!(ops[0].value.as_ref().unwrap(), &payload),
        other => panic!("unexpected decode: {other:?}"),
    }
}

#[test]
fn query_and_find_roundtrip() {
    let req = Request::Find {
        pattern: "/test/machines/*/ip".into(),
        matches: vec![Leaf {
            path: "/test/machines/*/ip".into(),
            value: Bytes::from_static(b"10.0.0.1"),
        }],
    };
    assert_eq!(roundtrip(req.clone()), req);

    let req = Request::Query {
        template: vec![Leaf {
            path: "/test/if/*/state".into(),
            value: Bytes::new(),
        }],
    };
    assert_eq!(roundtrip(req.clone()), req);
}

#[test]
fn callback_requests_roundtrip() {
    let req = Request::Watch {
        handle: 7,
        path: "/test/zones/private".into(),
        value: Some(Bytes::from_static(b"up")),
    };
    assert_eq!(roundtrip(req.clone()), req);

    let req = Request::Refresh {
        handle: 9,
        path: "/test/if/eth0".into(),
    };
    assert_eq!(roundtrip(req.clone()), req);
}

#[test]
fn reply_shapes_follow_opcode() {
    let reply = Reply::Status(Status::Busy.as_i32());
    let decoded = Reply::decode_for(OpCode::Set, reply.encode()).unwrap();
    assert_eq!(decoded, Reply::Status(-16));

    let reply = Reply::Value(None);
    assert_eq!(
        Reply::decode_for(OpCode::Get, reply.encode()).unwrap(),
        Reply::Value(None)
    );

    let reply = Reply::Paths(vec!["/test/a".into(), "/test/b".into()]);
    assert_eq!(
        Reply::decode_for(OpCode::Search, reply.clone().encode()).unwrap(),
        reply
    );

    let reply = Reply::Uint64(123456);
    assert_eq!(
        Reply::decode_for(OpCode::Timestamp, reply.clone().encode()).unwrap(),
        reply
    );
}

#[test]
fn truncated_payload_is_rejected() {
    let req = Request::Get { path: "/test/a".into() };
    let mut body = req.encode().to_vec();
    body.truncate(body.len() - 2);
    assert!(Request::decode(Bytes::from(body)).is_err());
}

#[test]
fn unknown_opcode_is_rejected() {
    let body = Bytes::from_static(&[0x7f, 0, 0, 0, 0]);
    assert!(Request::decode(body).is_err());
}

#[test]
fn status_errno_mapping() {
    assert_eq!(Status::Ok.as_i32(), 0);
    assert_eq!(Status::Refused.as_i32(), -1);
    assert_eq!(Status::Busy.as_i32(), -16);
    assert_eq!(Status::Invalid.as_i32(), -22);
    assert_eq!(Status::Range.as_i32(), -34);
    assert_eq!(Status::Timeout.as_i32(), -110);
    for code in [0, -1, -16, -22, -34, -110, -99] {
        assert_eq!(Status::from_i32(code).as_i32(), code);
    }
}
