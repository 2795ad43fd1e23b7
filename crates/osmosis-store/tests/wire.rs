//! Wire-format checks for the pieces peers exchange or persist: ops,
//! changes, failures. MsgPack with field names present, UUIDs as 16 raw
//! bytes, binary paths as byte strings.

use osmosis_common::{BinaryPath, Failure, FailureKind, Id, JsonValue};
use osmosis_store::{parse_jsonpath, Action, Change, CompiledJsonIdPath, Op, PathRef, ScalarAction};
use uuid::Uuid;

fn author() -> Uuid {
    Uuid::from_bytes([0xAB; 16])
}

#[test]
fn op_round_trips_through_msgpack() {
    let op = Op {
        id: Id::new(author(), 7),
        action: Action::Scalar(ScalarAction::Set {
            path: PathRef::Anchored(CompiledJsonIdPath {
                id: Id::new(author(), 3),
                fallback: BinaryPath::ROOT.append("items").append(2u32),
                suffix: vec![],
            }),
            value: JsonValue::from("payload"),
        }),
    };
    let bytes = rmp_serde::to_vec_named(&op).unwrap();
    let decoded: Op = rmp_serde::from_slice(&bytes).unwrap();
    assert_eq!(decoded, op);
}

#[test]
fn uuids_are_sixteen_raw_bytes() {
    let id = Id::new(author(), 1);
    let bytes = rmp_serde::to_vec_named(&id).unwrap();
    // bin8 marker, length 16, then the raw author bytes.
    let raw = [0xC4u8, 0x10]
        .iter()
        .copied()
        .chain(std::iter::repeat(0xAB).take(16))
        .collect::<Vec<u8>>();
    assert!(
        bytes.windows(raw.len()).any(|w| w == raw.as_slice()),
        "serialized id should embed the raw uuid: {bytes:02X?}"
    );
    // Field names ride along.
    assert!(bytes.windows(6).any(|w| w == b"author"));
    assert!(bytes.windows(5).any(|w| w == b"index"));
}

#[test]
fn binary_paths_serialize_as_their_encoding() {
    let path = BinaryPath::ROOT.append("foo").append(300u32);
    let bytes = rmp_serde::to_vec_named(&path).unwrap();
    assert!(
        bytes
            .windows(path.as_bytes().len())
            .any(|w| w == path.as_bytes()),
        "path encoding should appear verbatim: {bytes:02X?}"
    );
    let decoded: BinaryPath = rmp_serde::from_slice(&bytes).unwrap();
    assert_eq!(decoded, path);
}

#[test]
fn transactions_and_expressions_survive_the_wire() {
    let op = Op {
        id: Id::new(author(), 10),
        action: Action::Transaction(vec![
            ScalarAction::InitArray {
                path: PathRef::Compiled(parse_jsonpath("$.log").unwrap()),
            },
            ScalarAction::InsertUnique {
                path: PathRef::Compiled(parse_jsonpath("$.log").unwrap()),
                value: JsonValue::from(1),
            },
            ScalarAction::Set {
                path: PathRef::Compiled(
                    parse_jsonpath("$.items[?(@.price > 10 && @.stock != 0)].flag").unwrap(),
                ),
                value: JsonValue::Bool(true),
            },
        ]),
    };
    let bytes = rmp_serde::to_vec_named(&op).unwrap();
    let decoded: Op = rmp_serde::from_slice(&bytes).unwrap();
    assert_eq!(decoded, op);
}

#[test]
fn changes_and_failures_round_trip() {
    let change = Change::Move {
        from: BinaryPath::ROOT.append("a").append(1u32),
        to: BinaryPath::ROOT.append("a").append(0u32),
    };
    let bytes = rmp_serde::to_vec_named(&change).unwrap();
    assert_eq!(rmp_serde::from_slice::<Change>(&bytes).unwrap(), change);

    let failure = Failure::at(FailureKind::NotAnArray, "$.a").with_id(Id::new(author(), 2));
    let bytes = rmp_serde::to_vec_named(&failure).unwrap();
    assert_eq!(rmp_serde::from_slice::<Failure>(&bytes).unwrap(), failure);
}
