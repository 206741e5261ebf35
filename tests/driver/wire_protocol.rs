use bson::{bson, doc};
use byteorder::{LittleEndian, WriteBytesExt};

use mongodb_core::common::{ReadMode, ReadPreference};
use mongodb_core::error::Error;
use mongodb_core::wire_protocol::{Header, Message, OpCode, OpQueryFlags, OpReplyFlags, RequestIds};

use std::io::Cursor;

fn round_trip(message: &Message) -> Message {
    let mut buffer = Vec::new();
    message.write(&mut buffer).unwrap();
    assert_eq!(message.header().message_length as usize, buffer.len());
    Message::read(&mut Cursor::new(buffer)).unwrap()
}

#[test]
fn header_layout() {
    let header = Header::new(36, 7, 3, OpCode::Reply);
    let mut buffer = Vec::new();
    header.write(&mut buffer).unwrap();

    assert_eq!(16, buffer.len());
    assert_eq!(&[36, 0, 0, 0, 7, 0, 0, 0, 3, 0, 0, 0, 1, 0, 0, 0][..], &buffer[..]);
    assert_eq!(header, Header::read(&mut Cursor::new(buffer)).unwrap());
}

#[test]
fn header_rejects_unknown_opcodes_and_short_lengths() {
    let mut buffer = Vec::new();
    Header::new(16, 1, 0, OpCode::Reply).write(&mut buffer).unwrap();
    buffer[12] = 99;
    match Header::read(&mut Cursor::new(buffer)) {
        Err(Error::ResponseError(_)) => (),
        other => panic!("Expected ResponseError, got {:?}", other),
    }

    let mut buffer = Vec::new();
    Header::new(8, 1, 0, OpCode::Reply).write(&mut buffer).unwrap();
    assert!(Header::read(&mut Cursor::new(buffer)).is_err());
}

#[test]
fn empty_reply_reports_no_documents() {
    let reply = Message::new_reply(1, 5, OpReplyFlags::empty(), 0, 0, vec![]).unwrap();
    match round_trip(&reply) {
        Message::OpReply {
            ref header,
            number_returned,
            ref documents,
            ..
        } => {
            assert_eq!(0, number_returned);
            assert!(documents.is_empty());
            assert_eq!(5, header.response_to);
        }
        other => panic!("Expected a reply, got {:?}", other),
    }
    assert!(reply.into_documents().unwrap().is_empty());
}

#[test]
fn reply_documents_survive_the_wire() {
    let documents = vec![doc! { "ok": 1, "n": 2 }, doc! { "name": "second" }];
    let reply = Message::new_reply(2, 9, OpReplyFlags::empty(), 42, 3, documents.clone()).unwrap();

    let read = round_trip(&reply);
    assert_eq!(reply, read);
    assert_eq!(9, read.response_to());
    assert_eq!(documents, read.into_documents().unwrap());
}

#[test]
fn query_failure_carries_the_failure_document() {
    let failure = doc! { "$err": "bad query", "code": 2 };
    let reply = Message::new_reply(1, 1, OpReplyFlags::QUERY_FAILURE, 0, 0, vec![failure.clone()]).unwrap();

    match round_trip(&reply).into_documents() {
        Err(Error::QueryFailure(doc)) => assert_eq!(failure, doc),
        other => panic!("Expected QueryFailure, got {:?}", other),
    }

    let reply = Message::new_reply(1, 1, OpReplyFlags::CURSOR_NOT_FOUND, 11, 0, vec![]).unwrap();
    match reply.into_documents() {
        Err(Error::OperationError(ref msg)) => assert!(msg.contains("11")),
        other => panic!("Expected OperationError, got {:?}", other),
    }
}

#[test]
fn command_replies() {
    let ok = Message::new_reply(1, 1, OpReplyFlags::empty(), 0, 0, vec![doc! { "ok": 1.0, "n": 0 }]).unwrap();
    assert_eq!(doc! { "ok": 1.0, "n": 0 }, ok.into_command_reply().unwrap());

    let failed = Message::new_reply(1, 1, OpReplyFlags::empty(), 0, 0, vec![doc! { "ok": 0, "errmsg": "no such command" }])
        .unwrap();
    match failed.into_command_reply() {
        Err(Error::OperationError(ref msg)) => assert_eq!("no such command", msg),
        other => panic!("Expected OperationError, got {:?}", other),
    }

    let empty = Message::new_reply(1, 1, OpReplyFlags::empty(), 0, 0, vec![]).unwrap();
    match empty.into_command_reply() {
        Err(Error::ResponseError(_)) => (),
        other => panic!("Expected ResponseError, got {:?}", other),
    }
}

#[test]
fn commands_are_queries_on_the_command_namespace() {
    let command = Message::new_command(4, "admin", doc! { "isMaster": 1 }, OpQueryFlags::empty()).unwrap();
    match command {
        Message::OpQuery {
            ref header,
            ref namespace,
            number_to_return,
            ..
        } => {
            assert_eq!(OpCode::Query, header.op_code);
            assert_eq!(0, header.response_to);
            assert_eq!("admin.$cmd", namespace);
            assert_eq!(-1, number_to_return);
        }
        ref other => panic!("Expected a query, got {:?}", other),
    }
    assert!(command.expects_reply());

    let mut buffer = Vec::new();
    command.write(&mut buffer).unwrap();
    assert_eq!(command.header().message_length as usize, buffer.len());

    // Only replies can be read back.
    match Message::read(&mut Cursor::new(buffer)) {
        Err(Error::ResponseError(_)) => (),
        other => panic!("Expected ResponseError, got {:?}", other),
    }

    assert!(Message::new_command(1, "", doc! { "ping": 1 }, OpQueryFlags::empty()).is_err());
    assert!(!Message::new_kill_cursors(2, vec![1, 2]).expects_reply());
}

#[test]
fn reply_with_a_wrong_document_count_is_rejected() {
    let reply = Message::new_reply(1, 1, OpReplyFlags::empty(), 0, 0, vec![doc! { "a": 1 }]).unwrap();
    let mut buffer = Vec::new();
    reply.write(&mut buffer).unwrap();

    // Overwrite number_returned.
    let mut count = Vec::new();
    count.write_i32::<LittleEndian>(2).unwrap();
    buffer[32..36].copy_from_slice(&count);

    match Message::read(&mut Cursor::new(buffer)) {
        Err(Error::ResponseError(_)) => (),
        other => panic!("Expected ResponseError, got {:?}", other),
    }
}

#[test]
fn truncated_reply_is_an_io_error() {
    let reply = Message::new_reply(1, 1, OpReplyFlags::empty(), 0, 0, vec![doc! { "a": 1 }]).unwrap();
    let mut buffer = Vec::new();
    reply.write(&mut buffer).unwrap();
    buffer.truncate(buffer.len() - 3);

    match Message::read(&mut Cursor::new(buffer)) {
        Err(Error::IoError(_)) => (),
        other => panic!("Expected IoError, got {:?}", other),
    }
}

#[test]
fn secondary_reads_set_slave_ok() {
    let primary = ReadPreference::primary();
    let nearest = ReadPreference::new(ReadMode::Nearest, None);
    assert_eq!(OpQueryFlags::empty(), OpQueryFlags::with_read_preference(&primary));
    assert_eq!(OpQueryFlags::SLAVE_OK, OpQueryFlags::with_read_preference(&nearest));
}

#[test]
fn request_ids_are_shared_between_clones() {
    let ids = RequestIds::new();
    let clone = ids.clone();
    let first = ids.next();
    let second = clone.next();
    assert!(first > 0);
    assert_eq!(first + 1, second);
}
