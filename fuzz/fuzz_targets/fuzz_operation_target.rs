//! Fuzz target for operation validation.
//!
//! Arbitrary collection paths, document ids and field names must either
//! build a valid operation or be rejected, never panic.

#![no_main]

use libfuzzer_sys::fuzz_target;
use sync_queue::{Operation, OperationType};

fuzz_target!(|data: (&str, Option<&str>, &str, i64)| {
    let (collection, document, field, value) = data;

    let mut builder = Operation::builder(OperationType::StatsUpdate, collection)
        .field(field, value)
        .increment("count", value);
    if let Some(document) = document {
        builder = builder.document(document);
    }

    if let Ok(op) = builder.build() {
        assert!(op.validate().is_ok());
        // Dedup key exists exactly when the document is named.
        assert_eq!(op.dedup_key().is_some(), op.target().document_id.is_some());
    }
});
