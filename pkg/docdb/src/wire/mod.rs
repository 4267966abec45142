//! The message envelope: a 16-byte frame header plus
//! one body shape per op-code, each bit-exact on the wire.

use common::errors::*;

use crate::bson::document::Document;
use crate::bson::element::take;

pub const HEADER_LEN: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCode {
    Reply,
    Update,
    Insert,
    Query,
    GetMore,
    Delete,
    KillCursors,
}

impl OpCode {
    pub fn code(self) -> i32 {
        match self {
            OpCode::Reply => 1,
            OpCode::Update => 2001,
            OpCode::Insert => 2002,
            OpCode::Query => 2004,
            OpCode::GetMore => 2005,
            OpCode::Delete => 2006,
            OpCode::KillCursors => 2007,
        }
    }

    pub fn from_code(code: i32) -> Result<Self> {
        Ok(match code {
            1 => OpCode::Reply,
            2001 => OpCode::Update,
            2002 => OpCode::Insert,
            2004 => OpCode::Query,
            2005 => OpCode::GetMore,
            2006 => OpCode::Delete,
            2007 => OpCode::KillCursors,
            other => return Err(format_err!("decode-failure: unknown op-code {}", other)),
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Header {
    pub total_length: i32,
    pub request_id: i32,
    pub response_to: i32,
    pub op_code: OpCode,
}

impl Header {
    pub fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.total_length.to_le_bytes());
        out.extend_from_slice(&self.request_id.to_le_bytes());
        out.extend_from_slice(&self.response_to.to_le_bytes());
        out.extend_from_slice(&self.op_code.code().to_le_bytes());
    }

    pub fn decode(data: &[u8]) -> Result<Header> {
        if data.len() != HEADER_LEN {
            return Err(format_err!("decode-failure: header must be 16 bytes"));
        }
        let mut pos = 0;
        let total_length = i32::from_le_bytes(take(data, &mut pos, 4)?.try_into().unwrap());
        let request_id = i32::from_le_bytes(take(data, &mut pos, 4)?.try_into().unwrap());
        let response_to = i32::from_le_bytes(take(data, &mut pos, 4)?.try_into().unwrap());
        let op_code = OpCode::from_code(i32::from_le_bytes(
            take(data, &mut pos, 4)?.try_into().unwrap(),
        ))?;

        Ok(Header {
            total_length,
            request_id,
            response_to,
            op_code,
        })
    }
}

pub mod query_flags {
    pub const TAILABLE: i32 = 1 << 1;
    pub const SLAVE_OK: i32 = 1 << 2;
    pub const OPLOG_REPLAY: i32 = 1 << 3;
    pub const NO_CURSOR_TIMEOUT: i32 = 1 << 4;
    pub const AWAIT_DATA: i32 = 1 << 5;
    pub const EXHAUST: i32 = 1 << 6;
    pub const PARTIAL: i32 = 1 << 7;
}

pub mod insert_flags {
    pub const CONTINUE_ON_ERROR: i32 = 1;
}

pub mod update_flags {
    pub const UPSERT: i32 = 1;
    pub const MULTI_UPDATE: i32 = 1 << 1;
}

pub mod delete_flags {
    pub const SINGLE_REMOVE: i32 = 1;
}

pub mod reply_flags {
    pub const CURSOR_NOT_FOUND: i32 = 1;
    pub const QUERY_FAILURE: i32 = 1 << 1;
    pub const SHARD_CONFIG_STALE: i32 = 1 << 2;
    pub const AWAIT_CAPABLE: i32 = 1 << 3;
}

#[derive(Debug, Clone)]
pub struct QueryMessage {
    pub flags: i32,
    pub full_collection_name: String,
    pub number_to_skip: i32,
    pub number_to_return: i32,
    pub query: Document,
    pub fields_to_return: Option<Document>,
}

impl QueryMessage {
    /// A generic command, framed as a query over the
    /// pseudo-collection `db.$cmd` with `numberToReturn = -1`.
    pub fn command(db_name: &str, command: Document) -> QueryMessage {
        QueryMessage {
            flags: 0,
            full_collection_name: format!("{}.$cmd", db_name),
            number_to_skip: 0,
            number_to_return: -1,
            query: command,
            fields_to_return: None,
        }
    }

    pub fn body_len(&self) -> usize {
        4 + crate::bson::element::cstring_len(&self.full_collection_name)
            + 4
            + 4
            + self.query.encoded_len()
            + self
                .fields_to_return
                .as_ref()
                .map(|d| d.encoded_len())
                .unwrap_or(0)
    }

    fn encode_body(&self, out: &mut Vec<u8>) -> Result<()> {
        out.extend_from_slice(&self.flags.to_le_bytes());
        crate::bson::element::encode_cstring(&self.full_collection_name, out)?;
        out.extend_from_slice(&self.number_to_skip.to_le_bytes());
        out.extend_from_slice(&self.number_to_return.to_le_bytes());
        self.query.encode(out)?;
        if let Some(fields) = &self.fields_to_return {
            fields.encode(out)?;
        }
        Ok(())
    }

    fn decode_body(data: &[u8]) -> Result<QueryMessage> {
        let mut pos = 0;
        let flags = i32::from_le_bytes(take(data, &mut pos, 4)?.try_into().unwrap());
        let full_collection_name = crate::bson::element::decode_cstring(data, &mut pos)?;
        let number_to_skip = i32::from_le_bytes(take(data, &mut pos, 4)?.try_into().unwrap());
        let number_to_return = i32::from_le_bytes(take(data, &mut pos, 4)?.try_into().unwrap());
        let query = Document::decode(data, &mut pos)?;
        let fields_to_return = if pos < data.len() {
            Some(Document::decode(data, &mut pos)?)
        } else {
            None
        };

        Ok(QueryMessage {
            flags,
            full_collection_name,
            number_to_skip,
            number_to_return,
            query,
            fields_to_return,
        })
    }
}

#[derive(Debug, Clone)]
pub struct InsertMessage {
    pub flags: i32,
    pub full_collection_name: String,
    pub documents: Vec<Document>,
}

impl InsertMessage {
    pub fn body_len(&self) -> usize {
        4 + crate::bson::element::cstring_len(&self.full_collection_name)
            + self.documents.iter().map(Document::encoded_len).sum::<usize>()
    }

    fn encode_body(&self, out: &mut Vec<u8>) -> Result<()> {
        out.extend_from_slice(&self.flags.to_le_bytes());
        crate::bson::element::encode_cstring(&self.full_collection_name, out)?;
        for d in &self.documents {
            d.encode(out)?;
        }
        Ok(())
    }

    fn decode_body(data: &[u8]) -> Result<InsertMessage> {
        let mut pos = 0;
        let flags = i32::from_le_bytes(take(data, &mut pos, 4)?.try_into().unwrap());
        let full_collection_name = crate::bson::element::decode_cstring(data, &mut pos)?;
        let mut documents = Vec::new();
        while pos < data.len() {
            documents.push(Document::decode(data, &mut pos)?);
        }
        Ok(InsertMessage {
            flags,
            full_collection_name,
            documents,
        })
    }
}

#[derive(Debug, Clone)]
pub struct UpdateMessage {
    pub full_collection_name: String,
    pub flags: i32,
    pub selector: Document,
    pub update: Document,
}

impl UpdateMessage {
    pub fn body_len(&self) -> usize {
        4 + 4
            + crate::bson::element::cstring_len(&self.full_collection_name)
            + self.selector.encoded_len()
            + self.update.encoded_len()
    }

    fn encode_body(&self, out: &mut Vec<u8>) -> Result<()> {
        out.extend_from_slice(&0i32.to_le_bytes());
        crate::bson::element::encode_cstring(&self.full_collection_name, out)?;
        out.extend_from_slice(&self.flags.to_le_bytes());
        self.selector.encode(out)?;
        self.update.encode(out)?;
        Ok(())
    }

    fn decode_body(data: &[u8]) -> Result<UpdateMessage> {
        let mut pos = 0;
        let _zero = take(data, &mut pos, 4)?;
        let full_collection_name = crate::bson::element::decode_cstring(data, &mut pos)?;
        let flags = i32::from_le_bytes(take(data, &mut pos, 4)?.try_into().unwrap());
        let selector = Document::decode(data, &mut pos)?;
        let update = Document::decode(data, &mut pos)?;
        Ok(UpdateMessage {
            full_collection_name,
            flags,
            selector,
            update,
        })
    }
}

#[derive(Debug, Clone)]
pub struct DeleteMessage {
    pub full_collection_name: String,
    pub flags: i32,
    pub selector: Document,
}

impl DeleteMessage {
    pub fn body_len(&self) -> usize {
        4 + 4
            + crate::bson::element::cstring_len(&self.full_collection_name)
            + self.selector.encoded_len()
    }

    fn encode_body(&self, out: &mut Vec<u8>) -> Result<()> {
        out.extend_from_slice(&0i32.to_le_bytes());
        crate::bson::element::encode_cstring(&self.full_collection_name, out)?;
        out.extend_from_slice(&self.flags.to_le_bytes());
        self.selector.encode(out)?;
        Ok(())
    }

    fn decode_body(data: &[u8]) -> Result<DeleteMessage> {
        let mut pos = 0;
        let _zero = take(data, &mut pos, 4)?;
        let full_collection_name = crate::bson::element::decode_cstring(data, &mut pos)?;
        let flags = i32::from_le_bytes(take(data, &mut pos, 4)?.try_into().unwrap());
        let selector = Document::decode(data, &mut pos)?;
        Ok(DeleteMessage {
            full_collection_name,
            flags,
            selector,
        })
    }
}

#[derive(Debug, Clone)]
pub struct GetMoreMessage {
    pub full_collection_name: String,
    pub batch_size: i32,
    pub cursor_id: i64,
}

impl GetMoreMessage {
    pub fn body_len(&self) -> usize {
        4 + crate::bson::element::cstring_len(&self.full_collection_name) + 4 + 8
    }

    fn encode_body(&self, out: &mut Vec<u8>) -> Result<()> {
        out.extend_from_slice(&0i32.to_le_bytes());
        crate::bson::element::encode_cstring(&self.full_collection_name, out)?;
        out.extend_from_slice(&self.batch_size.to_le_bytes());
        out.extend_from_slice(&self.cursor_id.to_le_bytes());
        Ok(())
    }

    fn decode_body(data: &[u8]) -> Result<GetMoreMessage> {
        let mut pos = 0;
        let _zero = take(data, &mut pos, 4)?;
        let full_collection_name = crate::bson::element::decode_cstring(data, &mut pos)?;
        let batch_size = i32::from_le_bytes(take(data, &mut pos, 4)?.try_into().unwrap());
        let cursor_id = i64::from_le_bytes(take(data, &mut pos, 8)?.try_into().unwrap());
        Ok(GetMoreMessage {
            full_collection_name,
            batch_size,
            cursor_id,
        })
    }
}

#[derive(Debug, Clone)]
pub struct KillCursorsMessage {
    pub cursor_ids: Vec<i64>,
}

impl KillCursorsMessage {
    pub fn body_len(&self) -> usize {
        4 + 4 + self.cursor_ids.len() * 8
    }

    fn encode_body(&self, out: &mut Vec<u8>) -> Result<()> {
        out.extend_from_slice(&0i32.to_le_bytes());
        out.extend_from_slice(&(self.cursor_ids.len() as i32).to_le_bytes());
        for id in &self.cursor_ids {
            out.extend_from_slice(&id.to_le_bytes());
        }
        Ok(())
    }

    fn decode_body(data: &[u8]) -> Result<KillCursorsMessage> {
        let mut pos = 0;
        let _zero = take(data, &mut pos, 4)?;
        let count = i32::from_le_bytes(take(data, &mut pos, 4)?.try_into().unwrap());
        if count < 0 {
            return Err(format_err!("decode-failure: negative cursor count"));
        }
        let mut cursor_ids = Vec::with_capacity(count as usize);
        for _ in 0..count {
            cursor_ids.push(i64::from_le_bytes(take(data, &mut pos, 8)?.try_into().unwrap()));
        }
        Ok(KillCursorsMessage { cursor_ids })
    }
}

#[derive(Debug, Clone)]
pub struct ReplyMessage {
    pub flags: i32,
    pub cursor_id: i64,
    pub starting_from: i32,
    pub documents: Vec<Document>,
}

impl ReplyMessage {
    pub fn cursor_not_found(&self) -> bool {
        self.flags & reply_flags::CURSOR_NOT_FOUND != 0
    }

    pub fn query_failed(&self) -> bool {
        self.flags & reply_flags::QUERY_FAILURE != 0
    }

    pub fn shard_config_stale(&self) -> bool {
        self.flags & reply_flags::SHARD_CONFIG_STALE != 0
    }

    pub fn await_capable(&self) -> bool {
        self.flags & reply_flags::AWAIT_CAPABLE != 0
    }

    pub fn body_len(&self) -> usize {
        4 + 8
            + 4
            + 4
            + self.documents.iter().map(Document::encoded_len).sum::<usize>()
    }

    fn encode_body(&self, out: &mut Vec<u8>) -> Result<()> {
        out.extend_from_slice(&self.flags.to_le_bytes());
        out.extend_from_slice(&self.cursor_id.to_le_bytes());
        out.extend_from_slice(&self.starting_from.to_le_bytes());
        out.extend_from_slice(&(self.documents.len() as i32).to_le_bytes());
        for d in &self.documents {
            d.encode(out)?;
        }
        Ok(())
    }

    fn decode_body(data: &[u8]) -> Result<ReplyMessage> {
        let mut pos = 0;
        let flags = i32::from_le_bytes(take(data, &mut pos, 4)?.try_into().unwrap());
        let cursor_id = i64::from_le_bytes(take(data, &mut pos, 8)?.try_into().unwrap());
        let starting_from = i32::from_le_bytes(take(data, &mut pos, 4)?.try_into().unwrap());
        let doc_count = i32::from_le_bytes(take(data, &mut pos, 4)?.try_into().unwrap());
        if doc_count < 0 {
            return Err(format_err!("decode-failure: negative document count"));
        }
        let mut documents = Vec::with_capacity(doc_count as usize);
        for _ in 0..doc_count {
            documents.push(Document::decode(data, &mut pos)?);
        }
        Ok(ReplyMessage {
            flags,
            cursor_id,
            starting_from,
            documents,
        })
    }
}

/// Any body shape that can flow across a `Connection`, paired with the
/// header fields the connection layer owns (request-id, response-to).
#[derive(Debug, Clone)]
pub enum Message {
    Query(QueryMessage),
    Insert(InsertMessage),
    Update(UpdateMessage),
    Delete(DeleteMessage),
    GetMore(GetMoreMessage),
    KillCursors(KillCursorsMessage),
    Reply(ReplyMessage),
}

impl Message {
    pub fn op_code(&self) -> OpCode {
        match self {
            Message::Query(_) => OpCode::Query,
            Message::Insert(_) => OpCode::Insert,
            Message::Update(_) => OpCode::Update,
            Message::Delete(_) => OpCode::Delete,
            Message::GetMore(_) => OpCode::GetMore,
            Message::KillCursors(_) => OpCode::KillCursors,
            Message::Reply(_) => OpCode::Reply,
        }
    }

    fn body_len(&self) -> usize {
        match self {
            Message::Query(m) => m.body_len(),
            Message::Insert(m) => m.body_len(),
            Message::Update(m) => m.body_len(),
            Message::Delete(m) => m.body_len(),
            Message::GetMore(m) => m.body_len(),
            Message::KillCursors(m) => m.body_len(),
            Message::Reply(m) => m.body_len(),
        }
    }

    pub fn encoded_len(&self) -> usize {
        HEADER_LEN + self.body_len()
    }

    /// Fails locally with `document-too-large` rather than
    /// writing an oversized frame to the connection.
    pub fn validate_size(&self, max_bson_object_size: usize) -> Result<()> {
        let limit = HEADER_LEN + max_bson_object_size;
        let size = self.encoded_len();
        if size > limit {
            return Err(crate::error::DocumentTooLarge {
                size,
                limit,
            }
            .into());
        }
        Ok(())
    }

    pub fn encode(&self, request_id: i32, response_to: i32) -> Result<Vec<u8>> {
        let header = Header {
            total_length: self.encoded_len() as i32,
            request_id,
            response_to,
            op_code: self.op_code(),
        };

        let mut out = Vec::with_capacity(self.encoded_len());
        header.encode(&mut out);

        match self {
            Message::Query(m) => m.encode_body(&mut out)?,
            Message::Insert(m) => m.encode_body(&mut out)?,
            Message::Update(m) => m.encode_body(&mut out)?,
            Message::Delete(m) => m.encode_body(&mut out)?,
            Message::GetMore(m) => m.encode_body(&mut out)?,
            Message::KillCursors(m) => m.encode_body(&mut out)?,
            Message::Reply(m) => m.encode_body(&mut out)?,
        }

        Ok(out)
    }

    /// Decodes the body given an already-parsed header.
    pub fn decode_body(header: &Header, body: &[u8]) -> Result<Message> {
        Ok(match header.op_code {
            OpCode::Query => Message::Query(QueryMessage::decode_body(body)?),
            OpCode::Insert => Message::Insert(InsertMessage::decode_body(body)?),
            OpCode::Update => Message::Update(UpdateMessage::decode_body(body)?),
            OpCode::Delete => Message::Delete(DeleteMessage::decode_body(body)?),
            OpCode::GetMore => Message::GetMore(GetMoreMessage::decode_body(body)?),
            OpCode::KillCursors => Message::KillCursors(KillCursorsMessage::decode_body(body)?),
            OpCode::Reply => Message::Reply(ReplyMessage::decode_body(body)?),
        })
    }

    pub fn as_reply(&self) -> Option<&ReplyMessage> {
        match self {
            Message::Reply(r) => Some(r),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bson::element::{Element, Value};

    #[test]
    fn query_message_round_trips() {
        let mut query = Document::new();
        query
            .push(Element::new("ping", Value::Int32(1)).unwrap())
            .unwrap();

        let msg = Message::Query(QueryMessage::command("admin", query));
        let encoded = msg.encode(7, 0).unwrap();
        assert_eq!(encoded.len(), msg.encoded_len());

        let header = Header::decode(&encoded[..HEADER_LEN]).unwrap();
        assert_eq!(header.request_id, 7);
        assert_eq!(header.op_code, OpCode::Query);

        let decoded = Message::decode_body(&header, &encoded[HEADER_LEN..]).unwrap();
        match decoded {
            Message::Query(q) => {
                assert_eq!(q.full_collection_name, "admin.$cmd");
                assert_eq!(q.number_to_return, -1);
            }
            _ => panic!("expected query message"),
        }
    }

    #[test]
    fn reply_message_round_trips_with_flags() {
        let mut doc = Document::new();
        doc.push(Element::new("ok", Value::Double(1.0)).unwrap())
            .unwrap();

        let reply = ReplyMessage {
            flags: reply_flags::AWAIT_CAPABLE,
            cursor_id: 99,
            starting_from: 0,
            documents: vec![doc],
        };
        let msg = Message::Reply(reply);
        let encoded = msg.encode(0, 43).unwrap();

        let header = Header::decode(&encoded[..HEADER_LEN]).unwrap();
        assert_eq!(header.response_to, 43);

        let decoded = Message::decode_body(&header, &encoded[HEADER_LEN..]).unwrap();
        let reply = decoded.as_reply().unwrap();
        assert!(reply.await_capable());
        assert!(!reply.cursor_not_found());
        assert_eq!(reply.cursor_id, 99);
    }

    #[test]
    fn oversize_message_is_rejected_before_the_wire() {
        let big = vec![Value::Binary {
            subtype: 0,
            data: vec![0u8; 32],
        }];
        let mut doc = Document::new();
        doc.push(Element::new("blob", Value::Array(big)).unwrap())
            .unwrap();

        let msg = Message::Insert(InsertMessage {
            flags: 0,
            full_collection_name: "db.coll".to_string(),
            documents: vec![doc],
        });

        assert!(msg.validate_size(8).is_err());
        assert!(msg.validate_size(1_000_000).is_ok());
    }
}
