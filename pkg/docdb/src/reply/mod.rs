//! Reply callbacks: typed adapters that turn a raw
//! `ReplyMessage` into the shape a caller actually asked for, translating
//! `ok=0`/`queryFailed` replies into `server-error` up front.

use common::errors::*;

use crate::bson::element::Value;
use crate::bson::Document;
use crate::error::{ReplyShape, ServerError};
use crate::wire::ReplyMessage;

/// Checks `reply_flags::QUERY_FAILURE` and the first document's `ok`
/// field, raising `server-error` before any adapter gets a chance to
/// misinterpret a failure document as data.
fn check_failure(reply: &ReplyMessage) -> Result<()> {
    if reply.query_failed() {
        return Err(Error::from(failure_from_document(reply.documents.first())));
    }

    if let Some(doc) = reply.documents.first() {
        let ok = match doc.get_value("ok") {
            Some(Value::Double(v)) => Some(*v),
            Some(Value::Int32(v)) => Some(*v as f64),
            Some(Value::Boolean(b)) => Some(if *b { 1.0 } else { 0.0 }),
            _ => None,
        };
        if ok == Some(0.0) {
            return Err(Error::from(failure_from_document(Some(doc))));
        }
    }

    Ok(())
}

fn failure_from_document(doc: Option<&Document>) -> ServerError {
    let code = doc
        .and_then(|d| d.get_value("code"))
        .and_then(as_i32)
        .unwrap_or(-1);
    let message = doc
        .and_then(|d| {
            d.get_value("errmsg")
                .or_else(|| d.get_value("$err"))
        })
        .and_then(as_str)
        .unwrap_or("unknown server error")
        .to_string();
    ServerError { code, message }
}

fn as_i32(v: &Value) -> Option<i32> {
    match v {
        Value::Int32(i) => Some(*i),
        Value::Int64(i) => Some(*i as i32),
        Value::Double(d) => Some(*d as i32),
        _ => None,
    }
}

fn as_str(v: &Value) -> Option<&str> {
    match v {
        Value::String(s) => Some(s.as_str()),
        _ => None,
    }
}

/// Exactly one result document, failing with *reply-shape* if the reply
/// holds zero or more than one.
pub fn single_document(reply: &ReplyMessage) -> Result<Document> {
    check_failure(reply)?;
    match reply.documents.len() {
        1 => Ok(reply.documents[0].clone()),
        found => Err(Error::from(ReplyShape {
            expected: "exactly one document",
            found,
        })),
    }
}

/// A named array field from the single result document, defaulting to
/// `values`.
pub fn named_array(reply: &ReplyMessage, field: Option<&str>) -> Result<Vec<Value>> {
    let doc = single_document(reply)?;
    let field = field.unwrap_or("values");
    match doc.get_value(field) {
        Some(Value::Array(items)) => Ok(items.clone()),
        Some(other) => Err(Error::from(ReplyShape {
            expected: "array field",
            found: other.tag() as usize,
        })),
        None => Ok(Vec::new()),
    }
}

/// A cursor batch: the documents returned so far plus the cursor-id a
/// follow-up `getMore` should target (0 means exhausted).
pub struct CursorBatch {
    pub documents: Vec<Document>,
    pub cursor_id: i64,
}

pub fn cursor(reply: &ReplyMessage) -> Result<CursorBatch> {
    check_failure(reply)?;
    if reply.cursor_not_found() {
        return Err(Error::from(crate::error::CursorNotFound {
            cursor_id: reply.cursor_id,
        }));
    }
    Ok(CursorBatch {
        documents: reply.documents.clone(),
        cursor_id: reply.cursor_id,
    })
}

/// A single integer/long counter field from the result document (e.g. `n`
/// on a write command reply).
pub fn counter(reply: &ReplyMessage, field: &str) -> Result<i64> {
    let doc = single_document(reply)?;
    match doc.get_value(field) {
        Some(Value::Int32(v)) => Ok(*v as i64),
        Some(Value::Int64(v)) => Ok(*v),
        Some(Value::Double(v)) => Ok(*v as i64),
        Some(other) => Err(Error::from(ReplyShape {
            expected: "numeric field",
            found: other.tag() as usize,
        })),
        None => Err(Error::from(ReplyShape {
            expected: "numeric field",
            found: 0,
        })),
    }
}

/// The `ok` flag on its own, for commands whose only interesting result
/// is success/failure.
pub fn ack(reply: &ReplyMessage) -> Result<bool> {
    let doc = single_document(reply)?;
    let ok = match doc.get_value("ok") {
        Some(Value::Double(v)) => *v != 0.0,
        Some(Value::Int32(v)) => *v != 0,
        Some(Value::Boolean(b)) => *b,
        _ => true,
    };
    Ok(ok)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bson::element::Element;

    fn ok_document() -> Document {
        let mut doc = Document::new();
        doc.push(Element::new("ok", Value::Double(1.0)).unwrap())
            .unwrap();
        doc
    }

    fn reply_with(documents: Vec<Document>) -> ReplyMessage {
        ReplyMessage {
            flags: 0,
            cursor_id: 0,
            starting_from: 0,
            documents,
        }
    }

    #[test]
    fn single_document_rejects_empty_reply() {
        let reply = reply_with(vec![]);
        let err = single_document(&reply).unwrap_err();
        assert!(format!("{}", err).contains("reply-shape"));
    }

    #[test]
    fn single_document_rejects_multiple_documents() {
        let reply = reply_with(vec![ok_document(), ok_document()]);
        assert!(single_document(&reply).is_err());
    }

    #[test]
    fn ok_zero_is_translated_to_server_error() {
        let mut failing = Document::new();
        failing
            .push(Element::new("ok", Value::Double(0.0)).unwrap())
            .unwrap();
        failing
            .push(Element::new("errmsg", Value::String("bad query".to_string())).unwrap())
            .unwrap();
        failing
            .push(Element::new("code", Value::Int32(59)).unwrap())
            .unwrap();

        let reply = reply_with(vec![failing]);
        let err = single_document(&reply).unwrap_err();
        let msg = format!("{}", err);
        assert!(msg.contains("bad query"));
        assert!(msg.contains("59"));
    }

    #[test]
    fn query_failed_flag_is_translated_even_without_ok_field() {
        let mut doc = Document::new();
        doc.push(Element::new("$err", Value::String("not master".to_string())).unwrap())
            .unwrap();
        let reply = ReplyMessage {
            flags: crate::wire::reply_flags::QUERY_FAILURE,
            cursor_id: 0,
            starting_from: 0,
            documents: vec![doc],
        };
        let err = single_document(&reply).unwrap_err();
        assert!(format!("{}", err).contains("not master"));
    }

    #[test]
    fn named_array_defaults_to_values() {
        let mut doc = ok_document();
        doc.push(Element::new("values", Value::Array(vec![Value::Int32(1), Value::Int32(2)])).unwrap())
            .unwrap();
        let reply = reply_with(vec![doc]);
        let items = named_array(&reply, None).unwrap();
        assert_eq!(items.len(), 2);
    }

    #[test]
    fn counter_reads_n_field() {
        let mut doc = ok_document();
        doc.push(Element::new("n", Value::Int32(7)).unwrap()).unwrap();
        let reply = reply_with(vec![doc]);
        assert_eq!(counter(&reply, "n").unwrap(), 7);
    }
}
