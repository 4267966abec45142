use std::collections::HashMap;
use std::sync::Mutex;

use common::errors::*;

use crate::bson::element::{take, Element, Value};
use crate::bson::objectid::ObjectId;

/// An ordered sequence of elements with distinct names.
///
/// Lookup by name is O(1) via a lazily constructed index (`std::sync::Mutex`
/// rather than a `RefCell` so that a `Document` shared behind an `Arc` stays
/// `Sync`, matching the rest of this crate's multi-threaded posture).
#[derive(Debug)]
pub struct Document {
    elements: Vec<Element>,
    index: Mutex<Option<HashMap<String, usize>>>,
}

impl Clone for Document {
    fn clone(&self) -> Self {
        Self {
            elements: self.elements.clone(),
            index: Mutex::new(None),
        }
    }
}

impl PartialEq for Document {
    fn eq(&self, other: &Document) -> bool {
        self.elements == other.elements
    }
}

impl Document {
    pub fn new() -> Self {
        Self {
            elements: Vec::new(),
            index: Mutex::new(None),
        }
    }

    pub fn from_elements(elements: Vec<Element>) -> Result<Self> {
        let mut seen = std::collections::HashSet::new();
        for e in &elements {
            if !seen.insert(e.name().to_string()) {
                return Err(format_err!("duplicate element name: {}", e.name()));
            }
        }
        Ok(Self {
            elements,
            index: Mutex::new(None),
        })
    }

    pub fn push(&mut self, element: Element) -> Result<()> {
        if self.elements.iter().any(|e| e.name() == element.name()) {
            return Err(format_err!("duplicate element name: {}", element.name()));
        }
        self.elements.push(element);
        *self.index.lock().unwrap() = None;
        Ok(())
    }

    pub fn elements(&self) -> &[Element] {
        &self.elements
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    fn ensure_index(&self) {
        let mut guard = self.index.lock().unwrap();
        if guard.is_none() {
            let mut map = HashMap::with_capacity(self.elements.len());
            for (i, e) in self.elements.iter().enumerate() {
                map.insert(e.name().to_string(), i);
            }
            *guard = Some(map);
        }
    }

    pub fn get(&self, name: &str) -> Option<&Element> {
        self.ensure_index();
        let guard = self.index.lock().unwrap();
        let idx = *guard.as_ref().unwrap().get(name)?;
        // SAFETY-free: index is rebuilt whenever elements changes, and we
        // never shrink `elements` without invalidating the index.
        Some(&self.elements[idx])
    }

    pub fn get_value(&self, name: &str) -> Option<&Value> {
        self.get(name).map(|e| e.value())
    }

    /// Depth-first path lookup: each segment matches either a literal name
    /// or a regular expression against successive nesting levels.
    pub fn query_path(&self, path: &[PathSegment]) -> Vec<&Value> {
        let mut results = Vec::new();
        self.query_path_into(path, &mut results);
        results
    }

    fn query_path_into<'a>(&'a self, path: &[PathSegment], out: &mut Vec<&'a Value>) {
        let Some((first, rest)) = path.split_first() else {
            return;
        };

        for element in &self.elements {
            if !first.matches(element.name()) {
                continue;
            }

            if rest.is_empty() {
                out.push(element.value());
            } else if let Value::Document(child) = element.value() {
                child.query_path_into(rest, out);
            }
        }
    }

    /// Returns a copy of this document with a fresh `ObjectId` injected
    /// under `_id` at the head, unless `_id` is already present (one-shot,
    /// idempotent, matching the convention for `_id` injection).
    pub fn with_generated_id(&self) -> Result<Document> {
        if self.get("_id").is_some() {
            return Ok(self.clone());
        }

        let mut elements = Vec::with_capacity(self.elements.len() + 1);
        elements.push(Element::new("_id", Value::ObjectId(ObjectId::generate()))?);
        elements.extend(self.elements.iter().cloned());
        Document::from_elements(elements)
    }

    pub fn encoded_len(&self) -> usize {
        let mut total = 4usize;
        for e in &self.elements {
            total += e.encoded_len();
        }
        total + 1
    }

    pub fn encode(&self, out: &mut Vec<u8>) -> Result<()> {
        let len = self.encoded_len() as i32;
        out.extend_from_slice(&len.to_le_bytes());
        for e in &self.elements {
            e.encode(out)?;
        }
        out.push(0);
        Ok(())
    }

    pub fn encode_to_vec(&self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(self.encoded_len());
        self.encode(&mut out)?;
        Ok(out)
    }

    /// Decodes a document from `data` starting at `*pos`, advancing `*pos`
    /// past the document's bytes.
    pub fn decode(data: &[u8], pos: &mut usize) -> Result<Document> {
        let start = *pos;
        let total_len = i32::from_le_bytes(take(data, pos, 4)?.try_into().unwrap());
        if total_len < 5 {
            return Err(format_err!("decode-failure: invalid document length"));
        }
        let end = start + total_len as usize;
        if end > data.len() {
            return Err(format_err!(
                "decode-failure: document length exceeds buffer"
            ));
        }

        let mut elements = Vec::new();
        while *pos < end - 1 {
            let tag = take(data, pos, 1)?[0];
            let name = crate::bson::element::decode_cstring(data, pos)?;
            let value = Value::decode(tag, data, pos)?;
            elements.push(Element::new(name, value)?);
        }

        if take(data, pos, 1)?[0] != 0 {
            return Err(format_err!("decode-failure: document missing terminator"));
        }

        Document::from_elements(elements)
    }

    pub fn decode_from_slice(data: &[u8]) -> Result<Document> {
        let mut pos = 0;
        let doc = Document::decode(data, &mut pos)?;
        if pos != data.len() {
            return Err(format_err!("decode-failure: trailing bytes after document"));
        }
        Ok(doc)
    }
}

#[derive(Debug, Clone)]
pub enum PathSegment {
    Literal(String),
    Regex(regex::Regex),
}

impl PathSegment {
    /// Builds a `Regex` segment, wrapping the compile error the way the
    /// rest of this crate wraps decode/encode failures.
    pub fn regex(pattern: &str) -> Result<PathSegment> {
        Ok(PathSegment::Regex(
            regex::Regex::new(pattern).map_err(|e| format_err!("bad path regex: {}", e))?,
        ))
    }

    fn matches(&self, name: &str) -> bool {
        match self {
            PathSegment::Literal(l) => l == name,
            PathSegment::Regex(r) => r.is_match(name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bson::element::Value;

    #[test]
    fn empty_document_round_trips_and_reports_exact_size() {
        let doc = Document::new();
        let bytes = doc.encode_to_vec().unwrap();
        assert_eq!(bytes.len(), doc.encoded_len());
        assert_eq!(bytes.len(), 5); // int32 length + trailing null.

        let decoded = Document::decode_from_slice(&bytes).unwrap();
        assert_eq!(decoded, doc);
    }

    #[test]
    fn generated_id_produces_22_byte_document() {
        // {} -> insert injects a 12-byte ObjectId under "_id".
        let doc = Document::new().with_generated_id().unwrap();
        let bytes = doc.encode_to_vec().unwrap();
        assert_eq!(bytes.len(), 22);
        assert_eq!(doc.encoded_len(), 22);

        let decoded = Document::decode_from_slice(&bytes).unwrap();
        assert_eq!(decoded, doc);
    }

    #[test]
    fn generated_id_is_one_shot() {
        let mut doc = Document::new();
        doc.push(Element::new("_id", Value::Int32(7)).unwrap())
            .unwrap();
        let with_id = doc.with_generated_id().unwrap();
        assert_eq!(with_id.get_value("_id"), Some(&Value::Int32(7)));
    }

    #[test]
    fn rejects_duplicate_names() {
        let mut doc = Document::new();
        doc.push(Element::new("a", Value::Int32(1)).unwrap())
            .unwrap();
        let err = doc.push(Element::new("a", Value::Int32(2)).unwrap());
        assert!(err.is_err());
    }

    #[test]
    fn round_trips_nested_structures() {
        let mut scope = Document::new();
        scope
            .push(Element::new("x", Value::Int32(1)).unwrap())
            .unwrap();

        let mut doc = Document::new();
        doc.push(Element::new("d", Value::Double(1.5)).unwrap())
            .unwrap();
        doc.push(Element::new("s", Value::String("hi".into())).unwrap())
            .unwrap();
        doc.push(
            Element::new(
                "arr",
                Value::Array(vec![Value::Int32(1), Value::Int32(2), Value::Boolean(true)]),
            )
            .unwrap(),
        )
        .unwrap();
        doc.push(Element::new("nested", Value::Document(scope)).unwrap())
            .unwrap();

        let bytes = doc.encode_to_vec().unwrap();
        assert_eq!(bytes.len(), doc.encoded_len());

        let decoded = Document::decode_from_slice(&bytes).unwrap();
        assert_eq!(decoded, doc);
    }

    #[test]
    fn path_query_matches_depth_first() {
        let mut inner = Document::new();
        inner
            .push(Element::new("b", Value::Int32(42)).unwrap())
            .unwrap();

        let mut doc = Document::new();
        doc.push(Element::new("a", Value::Document(inner)).unwrap())
            .unwrap();

        let path = vec![
            PathSegment::Literal("a".to_string()),
            PathSegment::Literal("b".to_string()),
        ];

        let results = doc.query_path(&path);
        assert_eq!(results, vec![&Value::Int32(42)]);
    }

    #[test]
    fn path_query_matches_regex_segment() {
        let mut doc = Document::new();
        doc.push(Element::new("first_name", Value::String("a".to_string())).unwrap())
            .unwrap();
        doc.push(Element::new("last_name", Value::String("b".to_string())).unwrap())
            .unwrap();
        doc.push(Element::new("age", Value::Int32(1)).unwrap()).unwrap();

        let path = vec![PathSegment::regex("^.*_name$").unwrap()];
        let mut results = doc.query_path(&path);
        results.sort_by_key(|v| match v {
            Value::String(s) => s.clone(),
            _ => String::new(),
        });
        assert_eq!(
            results,
            vec![&Value::String("a".to_string()), &Value::String("b".to_string())]
        );
    }

    #[test]
    fn rejects_interior_nul_in_name() {
        let err = Element::new("bad\0name", Value::Null);
        assert!(err.is_err());
    }
}
