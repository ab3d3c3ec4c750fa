//! Content fingerprints over normalized title and body.

use iris_core::{Fingerprint, IssueRecord};
use sha2::{Digest, Sha256};

/// Lower-case, collapse runs of whitespace to one space, trim.
pub fn normalize_text(input: &str) -> String {
    input
        .split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ")
}

pub fn fingerprint_parts(title: &str, body: &str) -> Fingerprint {
    let mut hasher = Sha256::new();
    hasher.update(normalize_text(title).as_bytes());
    hasher.update(b"\n");
    hasher.update(normalize_text(body).as_bytes());
    Fingerprint::from_hex(hex::encode(hasher.finalize()))
}

pub fn fingerprint(record: &IssueRecord) -> Fingerprint {
    fingerprint_parts(&record.title, &record.body)
}
