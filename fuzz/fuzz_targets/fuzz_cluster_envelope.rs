//! Fuzz testing for signed cluster request envelopes.
//!
//! Checks that header parsing never panics, and that a signature computed
//! over arbitrary inputs is always 64 lowercase hex characters.
//!
//! ```bash
//! cargo +nightly fuzz run fuzz_cluster_envelope
//! ```

#![no_main]

use arbitrary::Arbitrary;
use axum::http::{HeaderMap, HeaderValue};
use cluster_admission::middleware::{SignedEnvelope, compute_signature};
use libfuzzer_sys::fuzz_target;

#[derive(Debug, Arbitrary)]
struct Input<'a> {
    secret: &'a str,
    method: &'a str,
    path: &'a str,
    headers: [Option<&'a [u8]>; 4],
}

fuzz_target!(|input: Input<'_>| {
    let mut headers = HeaderMap::new();
    for (name, value) in ["node-id", "timestamp", "nonce", "signature"]
        .into_iter()
        .zip(input.headers)
    {
        if let Some(value) = value.and_then(|v| HeaderValue::from_bytes(v).ok()) {
            headers.insert(name, value);
        }
    }

    if let Ok(envelope) = SignedEnvelope::from_headers(&headers) {
        let signature = compute_signature(
            input.secret,
            input.method,
            input.path,
            &envelope.timestamp,
            &envelope.nonce,
        );
        assert_eq!(signature.len(), 64);
        assert!(signature.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')));
    }
});
