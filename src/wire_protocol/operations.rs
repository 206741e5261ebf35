//! Wire protocol messages and their serialization.
use bson::{self, Bson, Document};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::error::Error::{self, ArgumentError, OperationError, QueryFailure, ResponseError};
use crate::error::Result;
use crate::wire_protocol::flags::{OpQueryFlags, OpReplyFlags};
use crate::wire_protocol::header::{Header, OpCode};

use std::io::{Cursor, Read, Write};
use std::mem;

/// Replies larger than this are treated as a corrupt frame.
pub const MAX_MESSAGE_SIZE: i32 = 48 * 1000 * 1000;

fn encode(doc: &Document) -> Result<Vec<u8>> {
    let mut buffer = Vec::new();
    bson::encode_document(&mut buffer, doc)?;
    Ok(buffer)
}

fn cstring_length(s: &str) -> i32 {
    // Add an extra byte after the string for null-termination.
    s.len() as i32 + 1
}

fn write_cstring<W: Write + ?Sized>(buffer: &mut W, s: &str) -> Result<()> {
    buffer.write_all(s.as_bytes())?;
    buffer.write_u8(0)?;
    Ok(())
}

/// Represents a message in the MongoDB Wire Protocol.
#[derive(Clone, Debug, PartialEq)]
pub enum Message {
    OpReply {
        /// The message header.
        header: Header,
        /// A bit vector of reply options.
        flags: OpReplyFlags,
        /// Uniquely identifies the cursor being returned.
        cursor_id: i64,
        /// The starting position for the cursor.
        starting_from: i32,
        /// The total number of documents being returned.
        number_returned: i32,
        /// The documents being returned.
        documents: Vec<Document>,
    },
    OpQuery {
        header: Header,
        flags: OpQueryFlags,
        /// The full qualified name of the collection, beginning with the
        /// database name and a dot separator.
        namespace: String,
        number_to_skip: i32,
        number_to_return: i32,
        query: Document,
        return_field_selector: Option<Document>,
    },
    OpGetMore {
        header: Header,
        // The wire protocol specifies that a 32-bit 0 field goes here
        namespace: String,
        number_to_return: i32,
        cursor_id: i64,
    },
    OpKillCursors {
        header: Header,
        // The wire protocol specifies that a 32-bit 0 field goes here
        cursor_ids: Vec<i64>,
    },
}

impl Message {
    /// Constructs a reply. Only servers (and test doubles standing in for
    /// them) send these.
    pub fn new_reply(
        request_id: i32,
        response_to: i32,
        flags: OpReplyFlags,
        cursor_id: i64,
        starting_from: i32,
        documents: Vec<Document>,
    ) -> Result<Message> {
        // flags, starting_from and number_returned, plus the cursor id.
        let mut total_length = Header::LENGTH + 3 * mem::size_of::<i32>() as i32 + mem::size_of::<i64>() as i32;
        for doc in &documents {
            total_length += encode(doc)?.len() as i32;
        }

        Ok(Message::OpReply {
            header: Header::new(total_length, request_id, response_to, OpCode::Reply),
            flags: flags,
            cursor_id: cursor_id,
            starting_from: starting_from,
            number_returned: documents.len() as i32,
            documents: documents,
        })
    }

    /// Constructs a new message request for a query.
    pub fn new_query(
        request_id: i32,
        flags: OpQueryFlags,
        namespace: String,
        number_to_skip: i32,
        number_to_return: i32,
        query: Document,
        return_field_selector: Option<Document>,
    ) -> Result<Message> {
        // flags, number_to_skip and number_to_return.
        let i32_length = 3 * mem::size_of::<i32>() as i32;

        let bson_length = encode(&query)?.len() as i32;
        let option_length = match return_field_selector {
            Some(ref doc) => encode(doc)?.len() as i32,
            None => 0,
        };

        let total_length =
            Header::LENGTH + i32_length + cstring_length(&namespace) + bson_length + option_length;

        Ok(Message::OpQuery {
            header: Header::new_request(total_length, request_id, OpCode::Query),
            flags: flags,
            namespace: namespace,
            number_to_skip: number_to_skip,
            number_to_return: number_to_return,
            query: query,
            return_field_selector: return_field_selector,
        })
    }

    /// Constructs a command: a single-document query against `<db>.$cmd`.
    pub fn new_command(request_id: i32, db: &str, command: Document, flags: OpQueryFlags) -> Result<Message> {
        if db.is_empty() {
            return Err(ArgumentError(String::from("A command requires a database name.")));
        }
        Message::new_query(request_id, flags, format!("{}.$cmd", db), 0, -1, command, None)
    }

    /// Constructs a new "get more" request message.
    pub fn new_get_more(request_id: i32, namespace: String, number_to_return: i32, cursor_id: i64) -> Message {
        // There are two i32 fields because of the reserved "ZERO".
        let i32_length = 2 * mem::size_of::<i32>() as i32;
        let i64_length = mem::size_of::<i64>() as i32;
        let total_length = Header::LENGTH + i32_length + cstring_length(&namespace) + i64_length;

        Message::OpGetMore {
            header: Header::new_request(total_length, request_id, OpCode::GetMore),
            namespace: namespace,
            number_to_return: number_to_return,
            cursor_id: cursor_id,
        }
    }

    /// Constructs a request to close server-side cursors.
    pub fn new_kill_cursors(request_id: i32, cursor_ids: Vec<i64>) -> Message {
        // ZERO and the number of cursor ids.
        let total_length = Header::LENGTH
            + 2 * mem::size_of::<i32>() as i32
            + cursor_ids.len() as i32 * mem::size_of::<i64>() as i32;

        Message::OpKillCursors {
            header: Header::new_request(total_length, request_id, OpCode::KillCursors),
            cursor_ids: cursor_ids,
        }
    }

    pub fn header(&self) -> &Header {
        match *self {
            Message::OpReply { ref header, .. }
            | Message::OpQuery { ref header, .. }
            | Message::OpGetMore { ref header, .. }
            | Message::OpKillCursors { ref header, .. } => header,
        }
    }

    pub fn request_id(&self) -> i32 {
        self.header().request_id
    }

    pub fn response_to(&self) -> i32 {
        self.header().response_to
    }

    /// Whether the sender expects a reply to this message.
    pub fn expects_reply(&self) -> bool {
        match *self {
            Message::OpQuery { .. } | Message::OpGetMore { .. } => true,
            _ => false,
        }
    }

    /// Attempts to write the serialized message to a buffer.
    pub fn write<W: Write + ?Sized>(&self, buffer: &mut W) -> Result<()> {
        // Serialize into memory first so a failure never leaves half a frame
        // on the wire.
        let mut out = Vec::with_capacity(self.header().message_length.max(0) as usize);
        self.header().write(&mut out)?;

        match *self {
            Message::OpReply {
                flags,
                cursor_id,
                starting_from,
                number_returned,
                ref documents,
                ..
            } => {
                out.write_i32::<LittleEndian>(flags.bits())?;
                out.write_i64::<LittleEndian>(cursor_id)?;
                out.write_i32::<LittleEndian>(starting_from)?;
                out.write_i32::<LittleEndian>(number_returned)?;
                for doc in documents {
                    bson::encode_document(&mut out, doc)?;
                }
            }
            Message::OpQuery {
                flags,
                ref namespace,
                number_to_skip,
                number_to_return,
                ref query,
                ref return_field_selector,
                ..
            } => {
                out.write_i32::<LittleEndian>(flags.bits())?;
                write_cstring(&mut out, namespace)?;
                out.write_i32::<LittleEndian>(number_to_skip)?;
                out.write_i32::<LittleEndian>(number_to_return)?;
                bson::encode_document(&mut out, query)?;
                if let Some(ref doc) = *return_field_selector {
                    bson::encode_document(&mut out, doc)?;
                }
            }
            Message::OpGetMore {
                ref namespace,
                number_to_return,
                cursor_id,
                ..
            } => {
                out.write_i32::<LittleEndian>(0)?;
                write_cstring(&mut out, namespace)?;
                out.write_i32::<LittleEndian>(number_to_return)?;
                out.write_i64::<LittleEndian>(cursor_id)?;
            }
            Message::OpKillCursors { ref cursor_ids, .. } => {
                out.write_i32::<LittleEndian>(0)?;
                out.write_i32::<LittleEndian>(cursor_ids.len() as i32)?;
                for id in cursor_ids {
                    out.write_i64::<LittleEndian>(*id)?;
                }
            }
        }

        if out.len() as i32 != self.header().message_length {
            return Err(ArgumentError(format!(
                "Serialized {} is {} bytes but its header declares {}.",
                self.header().op_code,
                out.len(),
                self.header().message_length
            )));
        }

        buffer.write_all(&out)?;
        Ok(())
    }

    // Reads the body of a reply whose header has already been consumed.
    fn read_reply<R: Read + ?Sized>(buffer: &mut R, header: Header) -> Result<Message> {
        if header.message_length > MAX_MESSAGE_SIZE {
            return Err(ResponseError(format!(
                "Reply of {} bytes exceeds the maximum message size.",
                header.message_length
            )));
        }

        let mut body = vec![0u8; (header.message_length - Header::LENGTH) as usize];
        buffer.read_exact(&mut body)?;
        let body_length = body.len() as u64;
        let mut body = Cursor::new(body);

        let flags = body.read_i32::<LittleEndian>()?;
        let cursor_id = body.read_i64::<LittleEndian>()?;
        let starting_from = body.read_i32::<LittleEndian>()?;
        let number_returned = body.read_i32::<LittleEndian>()?;

        let mut documents = Vec::new();
        while body.position() < body_length {
            documents.push(bson::decode_document(&mut body)?);
        }

        if documents.len() as i32 != number_returned {
            return Err(ResponseError(format!(
                "Reply declared {} documents but carried {}.",
                number_returned,
                documents.len()
            )));
        }

        Ok(Message::OpReply {
            header: header,
            flags: OpReplyFlags::from_bits_truncate(flags),
            cursor_id: cursor_id,
            starting_from: starting_from,
            number_returned: number_returned,
            documents: documents,
        })
    }

    /// Attempts to read a serialized reply Message from a buffer.
    pub fn read<R: Read + ?Sized>(buffer: &mut R) -> Result<Message> {
        let header = Header::read(buffer)?;
        match header.op_code {
            OpCode::Reply => Message::read_reply(buffer, header),
            opcode => Err(ResponseError(format!(
                "Expected to read OpCode::Reply but instead found opcode {}",
                opcode
            ))),
        }
    }

    /// Unwraps a query reply into its documents, surfacing reply flags as
    /// errors.
    pub fn into_documents(self) -> Result<Vec<Document>> {
        match self {
            Message::OpReply { flags, mut documents, cursor_id, .. } => {
                if flags.contains(OpReplyFlags::QUERY_FAILURE) {
                    let failure = if documents.is_empty() {
                        Document::new()
                    } else {
                        documents.swap_remove(0)
                    };
                    return Err(QueryFailure(failure));
                }

                if flags.contains(OpReplyFlags::CURSOR_NOT_FOUND) {
                    return Err(OperationError(format!("Cursor {} was not found on the server.", cursor_id)));
                }

                Ok(documents)
            }
            other => Err(ResponseError(format!(
                "Expected a reply but received {}.",
                other.header().op_code
            ))),
        }
    }

    /// Unwraps a command reply into its single result document. A reply
    /// with `ok: 0` is a failed command.
    pub fn into_command_reply(self) -> Result<Document> {
        let mut documents = self.into_documents()?;
        if documents.len() != 1 {
            return Err(ResponseError(format!(
                "A command reply must carry exactly one document, found {}.",
                documents.len()
            )));
        }

        let doc = documents.remove(0);
        if !command_succeeded(&doc) {
            let message = match doc.get("errmsg") {
                Some(&Bson::String(ref s)) => s.to_owned(),
                _ => format!("command failed: {}", doc),
            };
            return Err(Error::OperationError(message));
        }

        Ok(doc)
    }
}

/// Reads the `ok` field of a command reply.
pub fn command_succeeded(doc: &Document) -> bool {
    match doc.get("ok") {
        Some(&Bson::I32(v)) => v != 0,
        Some(&Bson::I64(v)) => v != 0,
        Some(&Bson::FloatingPoint(v)) => v != 0.0,
        Some(&Bson::Boolean(b)) => b,
        _ => false,
    }
}
