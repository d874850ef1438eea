//! Fuzz target for persisted record decoding.
//!
//! Rows come back from SQLite after crashes, downgrades and disk errors, so
//! decoding must never panic, and whatever it accepts must be a valid
//! operation that re-encodes cleanly.

#![no_main]

use libfuzzer_sys::fuzz_target;
use sync_queue::codec::{decode, encode, StoredRecord};

fuzz_target!(|data: (u8, &str)| {
    let (version, body) = data;
    let record = StoredRecord {
        schema_version: u32::from(version % 4),
        body: body.to_string(),
    };

    // Should never panic
    if let Ok(op) = decode(&record) {
        assert!(op.validate().is_ok());

        let reencoded = encode(&op).expect("valid operation encodes");
        let again = decode(&reencoded).expect("own encoding decodes");
        assert_eq!(again.id(), op.id());
        assert_eq!(again.target(), op.target());
        assert_eq!(again.retry_count(), op.retry_count());
    }
});
