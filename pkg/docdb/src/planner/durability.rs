//! Durability (write-concern) descriptors and their mapping onto the
//! `writeConcern` sub-document.

use crate::bson::element::{Element, Value};
use crate::bson::Document;

#[derive(Debug, Clone, PartialEq)]
pub enum DurabilityLevel {
    None,
    Ack,
    Journal,
    Replicas(i32),
    Majority,
    Fsync,
}

#[derive(Debug, Clone)]
pub struct Durability {
    pub level: DurabilityLevel,
    pub wtimeout: Option<i32>,
}

impl Durability {
    pub fn new(level: DurabilityLevel) -> Self {
        Durability {
            level,
            wtimeout: None,
        }
    }

    pub fn with_wtimeout(mut self, wtimeout: i32) -> Self {
        self.wtimeout = Some(wtimeout);
        self
    }

    /// Builds the `writeConcern` sub-document: `NONE` -> `w:0`; `ACK` ->
    /// `w:1`; every other level copies its fields through unmodified save
    /// for the legacy `getlasterror` sentinel this crate never emits.
    pub fn write_concern(&self) -> Document {
        let mut doc = Document::new();
        match &self.level {
            DurabilityLevel::None => {
                doc.push(Element::new("w", Value::Int32(0)).unwrap()).unwrap();
            }
            DurabilityLevel::Ack => {
                doc.push(Element::new("w", Value::Int32(1)).unwrap()).unwrap();
            }
            DurabilityLevel::Journal => {
                doc.push(Element::new("w", Value::Int32(1)).unwrap()).unwrap();
                doc.push(Element::new("j", Value::Boolean(true)).unwrap()).unwrap();
            }
            DurabilityLevel::Replicas(n) => {
                doc.push(Element::new("w", Value::Int32(*n)).unwrap()).unwrap();
            }
            DurabilityLevel::Majority => {
                doc.push(Element::new("w", Value::String("majority".to_string())).unwrap())
                    .unwrap();
            }
            DurabilityLevel::Fsync => {
                doc.push(Element::new("w", Value::Int32(1)).unwrap()).unwrap();
                doc.push(Element::new("fsync", Value::Boolean(true)).unwrap()).unwrap();
            }
        }

        if let Some(wtimeout) = self.wtimeout {
            doc.push(Element::new("wtimeout", Value::Int32(wtimeout)).unwrap())
                .unwrap();
        }

        doc
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn none_maps_to_w_zero() {
        let wc = Durability::new(DurabilityLevel::None).write_concern();
        assert_eq!(wc.get_value("w"), Some(&Value::Int32(0)));
    }

    #[test]
    fn journal_sets_both_w_and_j() {
        let wc = Durability::new(DurabilityLevel::Journal).write_concern();
        assert_eq!(wc.get_value("w"), Some(&Value::Int32(1)));
        assert_eq!(wc.get_value("j"), Some(&Value::Boolean(true)));
    }

    #[test]
    fn wtimeout_is_optional() {
        let wc = Durability::new(DurabilityLevel::Ack)
            .with_wtimeout(5000)
            .write_concern();
        assert_eq!(wc.get_value("wtimeout"), Some(&Value::Int32(5000)));
    }
}
