//! Fuzz testing for client identity resolution.
//!
//! Peer addresses, proxy lists and forwarded-address headers all come from
//! the network or from operator config. This target checks that resolving a
//! client key:
//!
//! - Never panics on any input
//! - Never believes headers from a peer that is not a trusted relay
//! - Yields the bare peer address whenever the peer is untrusted
//!
//! # Running the Fuzz Tests
//!
//! ```bash
//! cargo +nightly install cargo-fuzz
//! cargo +nightly fuzz run fuzz_client_key
//! cargo +nightly fuzz run fuzz_client_key -- -max_total_time=60
//! ```

#![no_main]

use arbitrary::Arbitrary;
use axum::http::{HeaderMap, HeaderValue};
use cluster_admission::middleware::ip::{resolve_client_ip, strip_port};
use cluster_admission::middleware::{CidrRange, TrustResolver};
use libfuzzer_sys::fuzz_target;

#[derive(Debug, Arbitrary)]
struct Input<'a> {
    peer: &'a str,
    trusted_proxies: Vec<&'a str>,
    forwarded_for: Option<&'a [u8]>,
    real_ip: Option<&'a [u8]>,
}

fuzz_target!(|input: Input<'_>| {
    for entry in &input.trusted_proxies {
        if let Some(range) = CidrRange::parse(entry) {
            assert!(range.prefix_len() <= 128);
        }
    }

    let proxies: Vec<String> = input.trusted_proxies.iter().map(|s| s.to_string()).collect();
    let trust = TrustResolver::new(&proxies);
    let trusted = trust.is_trusted_relay(strip_port(input.peer));

    let mut headers = HeaderMap::new();
    if let Some(value) = input.forwarded_for.and_then(|v| HeaderValue::from_bytes(v).ok()) {
        headers.insert("x-forwarded-for", value);
    }
    if let Some(value) = input.real_ip.and_then(|v| HeaderValue::from_bytes(v).ok()) {
        headers.insert("x-real-ip", value);
    }

    let key = resolve_client_ip(input.peer, &headers, &trust);

    if !trusted {
        let without_headers = resolve_client_ip(input.peer, &HeaderMap::new(), &trust);
        assert_eq!(key, without_headers);
    }
});
