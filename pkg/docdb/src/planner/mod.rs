//! Batched-write planner: turns a flat list of write
//! operations into one or more `insert`/`update`/`delete` command
//! documents, each sized to fit under a server's `maxCommandSize` and
//! `maxWriteBatchSize`.

pub mod durability;

use common::errors::*;

use crate::bson::{Document, Element, Value};
use crate::error::DocumentTooLarge;

pub use durability::{Durability, DurabilityLevel};

#[derive(Debug, Clone)]
pub enum WriteOperation {
    Insert(Document),
    Update {
        query: Document,
        update: Document,
        multi: bool,
        upsert: bool,
    },
    Delete { query: Document, single: bool },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OpKind {
    Insert,
    Update,
    Delete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BundlingMode {
    Reordered,
    SerializeAndContinue,
    SerializeAndStop,
}

#[derive(Clone)]
pub struct PlannerOptions {
    pub collection: String,
    pub max_command_size: usize,
    pub max_ops_per_bundle: usize,
    pub durability: Durability,
    pub mode: BundlingMode,
}

/// One ready-to-send command document.
pub struct Bundle {
    pub command: Document,
}

/// Splits `operations` into bundles per `options.mode`. Rejects up front
/// any single operation too large to ever fit in one bundle.
pub fn plan(operations: Vec<WriteOperation>, options: &PlannerOptions) -> Result<Vec<Bundle>> {
    let operations = operations
        .into_iter()
        .map(|op| match op {
            WriteOperation::Insert(doc) => Ok(WriteOperation::Insert(doc.with_generated_id()?)),
            other => Ok(other),
        })
        .collect::<Result<Vec<_>>>()?;

    for op in &operations {
        let total = op_payload_size(&op) + index_overhead(0);
        if total > options.max_command_size {
            return Err(Error::from(DocumentTooLarge {
                size: total,
                limit: options.max_command_size,
            }));
        }
    }

    match options.mode {
        BundlingMode::SerializeAndStop => serialize_walk(operations, options, true),
        BundlingMode::SerializeAndContinue => serialize_walk(operations, options, false),
        BundlingMode::Reordered => reordered_plan(operations, options),
    }
}

fn op_kind(op: &WriteOperation) -> OpKind {
    match op {
        WriteOperation::Insert(_) => OpKind::Insert,
        WriteOperation::Update { .. } => OpKind::Update,
        WriteOperation::Delete { .. } => OpKind::Delete,
    }
}

fn op_payload_size(op: &WriteOperation) -> usize {
    match op {
        WriteOperation::Insert(doc) => doc.encoded_len(),
        WriteOperation::Update { query, update, .. } => {
            query.encoded_len() + update.encoded_len() + 29
        }
        WriteOperation::Delete { query, .. } => query.encoded_len() + 20,
    }
}

fn op_value(op: &WriteOperation) -> Result<Value> {
    Ok(match op {
        WriteOperation::Insert(doc) => Value::Document(doc.clone()),
        WriteOperation::Update {
            query,
            update,
            multi,
            upsert,
        } => {
            let mut wrapper = Document::new();
            wrapper.push(Element::new("q", Value::Document(query.clone()))?)?;
            wrapper.push(Element::new("u", Value::Document(update.clone()))?)?;
            wrapper.push(Element::new("upsert", Value::Boolean(*upsert))?)?;
            wrapper.push(Element::new("multi", Value::Boolean(*multi))?)?;
            Value::Document(wrapper)
        }
        WriteOperation::Delete { query, single } => {
            let mut wrapper = Document::new();
            wrapper.push(Element::new("q", Value::Document(query.clone()))?)?;
            wrapper.push(Element::new(
                "limit",
                Value::Int32(if *single { 1 } else { 0 }),
            )?)?;
            Value::Document(wrapper)
        }
    })
}

fn command_name(kind: OpKind) -> &'static str {
    match kind {
        OpKind::Insert => "insert",
        OpKind::Update => "update",
        OpKind::Delete => "delete",
    }
}

fn array_field_name(kind: OpKind) -> &'static str {
    match kind {
        OpKind::Insert => "documents",
        OpKind::Update => "updates",
        OpKind::Delete => "deletes",
    }
}

fn index_overhead(index: usize) -> usize {
    if index < 10 {
        3
    } else if index < 100 {
        4
    } else if index < 1000 {
        5
    } else if index < 10000 {
        6
    } else {
        index.to_string().len() + 2
    }
}

fn base_overhead(kind: OpKind, collection: &str, durability: &Durability, ordered: bool) -> Result<usize> {
    Ok(skeleton_command(kind, collection, durability, ordered)?.encoded_len())
}

fn skeleton_command(kind: OpKind, collection: &str, durability: &Durability, ordered: bool) -> Result<Document> {
    let mut doc = Document::new();
    doc.push(Element::new(
        command_name(kind),
        Value::String(collection.to_string()),
    )?)?;
    doc.push(Element::new("ordered", Value::Boolean(ordered))?)?;
    doc.push(Element::new(
        "writeConcern",
        Value::Document(durability.write_concern()),
    )?)?;
    doc.push(Element::new(array_field_name(kind), Value::Array(Vec::new()))?)?;
    Ok(doc)
}

fn build_bundle(
    kind: OpKind,
    ops: &[WriteOperation],
    collection: &str,
    durability: &Durability,
    ordered: bool,
) -> Result<Bundle> {
    let mut doc = Document::new();
    doc.push(Element::new(
        command_name(kind),
        Value::String(collection.to_string()),
    )?)?;
    doc.push(Element::new("ordered", Value::Boolean(ordered))?)?;
    doc.push(Element::new(
        "writeConcern",
        Value::Document(durability.write_concern()),
    )?)?;

    let mut values = Vec::with_capacity(ops.len());
    for op in ops {
        values.push(op_value(op)?);
    }
    doc.push(Element::new(array_field_name(kind), Value::Array(values))?)?;

    Ok(Bundle { command: doc })
}

/// Shared implementation of serialize-and-stop (`ordered=true`) and
/// serialize-and-continue (`ordered=false`): one pass in submission order,
/// closing the current bundle on type change, size overflow, or hitting
/// `maxOpsPerBundle`.
fn serialize_walk(operations: Vec<WriteOperation>, options: &PlannerOptions, ordered: bool) -> Result<Vec<Bundle>> {
    let mut bundles = Vec::new();
    let mut current_kind: Option<OpKind> = None;
    let mut current_ops: Vec<WriteOperation> = Vec::new();
    let mut current_size = 0usize;

    for op in operations {
        let kind = op_kind(&op);
        let payload = op_payload_size(&op);

        if current_kind != Some(kind) {
            if !current_ops.is_empty() {
                bundles.push(build_bundle(
                    current_kind.unwrap(),
                    &current_ops,
                    &options.collection,
                    &options.durability,
                    ordered,
                )?);
                current_ops.clear();
            }
            current_kind = Some(kind);
            current_size = base_overhead(kind, &options.collection, &options.durability, ordered)?;
        }

        let index = current_ops.len();
        let op_total = payload + index_overhead(index);

        if !current_ops.is_empty()
            && (current_size + op_total > options.max_command_size
                || current_ops.len() >= options.max_ops_per_bundle)
        {
            bundles.push(build_bundle(
                kind,
                &current_ops,
                &options.collection,
                &options.durability,
                ordered,
            )?);
            current_ops.clear();
            current_size = base_overhead(kind, &options.collection, &options.durability, ordered)?;
        }

        let index = current_ops.len();
        current_size += payload + index_overhead(index);
        current_ops.push(op);
    }

    if !current_ops.is_empty() {
        bundles.push(build_bundle(
            current_kind.unwrap(),
            &current_ops,
            &options.collection,
            &options.durability,
            ordered,
        )?);
    }

    Ok(bundles)
}

/// Reordered mode: bucket by type (insert, update, delete, in that fixed
/// order), sort each bucket by size descending, and greedily first-fit
/// pack the largest operation that still fits the remaining budget.
fn reordered_plan(operations: Vec<WriteOperation>, options: &PlannerOptions) -> Result<Vec<Bundle>> {
    let mut buckets: [Vec<WriteOperation>; 3] = [Vec::new(), Vec::new(), Vec::new()];
    for op in operations {
        let idx = match op_kind(&op) {
            OpKind::Insert => 0,
            OpKind::Update => 1,
            OpKind::Delete => 2,
        };
        buckets[idx].push(op);
    }

    let mut bundles = Vec::new();
    for (idx, bucket) in buckets.into_iter().enumerate() {
        if bucket.is_empty() {
            continue;
        }
        let kind = [OpKind::Insert, OpKind::Update, OpKind::Delete][idx];

        let mut remaining: Vec<(usize, WriteOperation)> = bucket
            .into_iter()
            .map(|op| (op_payload_size(&op), op))
            .collect();
        remaining.sort_by(|a, b| b.0.cmp(&a.0));

        let base = base_overhead(kind, &options.collection, &options.durability, false)?;

        while !remaining.is_empty() {
            let mut bundle_ops: Vec<WriteOperation> = Vec::new();
            let mut size = base;
            let mut i = 0;
            while i < remaining.len() && bundle_ops.len() < options.max_ops_per_bundle {
                let payload = remaining[i].0;
                let candidate = size + payload + index_overhead(bundle_ops.len());
                if candidate <= options.max_command_size {
                    let (_, op) = remaining.remove(i);
                    bundle_ops.push(op);
                    size = candidate;
                } else {
                    i += 1;
                }
            }

            if bundle_ops.is_empty() {
                // Nothing of this type fit even alone (the base command
                // overhead alone crowds it out); pack it anyway rather than
                // loop forever, since a single-op bundle can't be split.
                let (_, op) = remaining.remove(0);
                bundle_ops.push(op);
            }

            bundles.push(build_bundle(
                kind,
                &bundle_ops,
                &options.collection,
                &options.durability,
                false,
            )?);
        }
    }

    Ok(bundles)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn insert_of_size(payload_bytes: usize) -> WriteOperation {
        let mut doc = Document::new();
        doc.push(Element::new("data", Value::String("x".repeat(payload_bytes))).unwrap())
            .unwrap();
        WriteOperation::Insert(doc)
    }

    fn options(mode: BundlingMode, max_command_size: usize, max_ops_per_bundle: usize) -> PlannerOptions {
        PlannerOptions {
            collection: "widgets".to_string(),
            max_command_size,
            max_ops_per_bundle,
            durability: Durability::new(DurabilityLevel::Ack),
            mode,
        }
    }

    #[test]
    fn small_batch_fits_in_one_bundle_and_is_unordered() {
        // Many small inserts well under the size budget.
        let ops: Vec<_> = (0..600).map(|_| insert_of_size(32)).collect();
        let bundles = plan(ops, &options(BundlingMode::SerializeAndContinue, 16 * 1024 * 1024, 1000)).unwrap();
        assert_eq!(bundles.len(), 1);
        let array = bundles[0].command.get_value("documents").unwrap();
        match array {
            Value::Array(items) => assert_eq!(items.len(), 600),
            other => panic!("expected array, found {:?}", other),
        }
        assert_eq!(bundles[0].command.get_value("ordered"), Some(&Value::Boolean(false)));
    }

    #[test]
    fn op_count_limit_splits_into_even_bundles() {
        // 2500 ops, maxOpsPerBundle=1000 -> 1000/1000/500.
        let ops: Vec<_> = (0..2500).map(|_| insert_of_size(16)).collect();
        let bundles = plan(ops, &options(BundlingMode::SerializeAndStop, 16 * 1024 * 1024, 1000)).unwrap();
        assert_eq!(bundles.len(), 3);
        let counts: Vec<usize> = bundles
            .iter()
            .map(|b| match b.command.get_value("documents").unwrap() {
                Value::Array(items) => items.len(),
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(counts, vec![1000, 1000, 500]);
        for bundle in &bundles {
            assert_eq!(bundle.command.get_value("ordered"), Some(&Value::Boolean(true)));
        }
    }

    #[test]
    fn large_documents_split_on_command_size_not_count() {
        // Large docs forced to split purely by byte budget well before
        // maxOpsPerBundle is ever reached.
        let max_command_size = 1_000_000;
        let ops: Vec<_> = (0..10).map(|_| insert_of_size(150_000)).collect();
        let bundles = plan(ops, &options(BundlingMode::SerializeAndContinue, max_command_size, 1000)).unwrap();
        assert!(bundles.len() >= 2);
        let mut total_docs = 0;
        for bundle in &bundles {
            assert!(bundle.command.encoded_len() <= max_command_size);
            match bundle.command.get_value("documents").unwrap() {
                Value::Array(items) => total_docs += items.len(),
                _ => unreachable!(),
            }
        }
        assert_eq!(total_docs, 10);
    }

    #[test]
    fn oversize_single_document_is_rejected_up_front() {
        let max_command_size = 1_000_000;
        let ops = vec![insert_of_size(2_000_000)];
        let err = plan(ops, &options(BundlingMode::SerializeAndContinue, max_command_size, 1000)).unwrap_err();
        assert!(format!("{}", err).contains("document-too-large"));
    }

    #[test]
    fn reordered_mode_groups_inserts_before_deletes() {
        let mut ops = vec![
            WriteOperation::Delete {
                query: Document::new(),
                single: true,
            },
            insert_of_size(16),
            WriteOperation::Delete {
                query: Document::new(),
                single: false,
            },
        ];
        ops.reverse();
        let bundles = plan(ops, &options(BundlingMode::Reordered, 16 * 1024 * 1024, 1000)).unwrap();
        assert_eq!(bundles.len(), 2);
        assert!(bundles[0].command.get_value("insert").is_some());
        assert!(bundles[1].command.get_value("delete").is_some());
        assert_eq!(bundles[0].command.get_value("ordered"), Some(&Value::Boolean(false)));
    }
}
