//! Criterion benchmarks for the identity primitives.
//!
//! The reconciliation tick verifies a session-token signature per master
//! every time an endpoint changes, and the pairing server signs a challenge
//! per request, so sign/verify latency bounds how cheap those paths are.
//! Keypair generation is deliberately not benchmarked per-iteration: it
//! runs once per install.
//!
//! Run with:
//! ```bash
//! cargo bench --package stagelink-core --bench crypto_bench
//! ```

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use stagelink_core::{
    canonical_session_message, endpoint_key, fingerprint, generate_challenge, generate_keypair,
    sign, verify, Keypair,
};

fn bench_keys() -> Keypair {
    generate_keypair().expect("keypair generation for benchmark setup")
}

/// Benchmarks challenge signing, the pairing server's per-request cost.
fn bench_sign(c: &mut Criterion) {
    let keys = bench_keys();
    let challenge = generate_challenge();

    c.bench_function("sign_challenge", |b| {
        b.iter(|| {
            sign(black_box(&keys.private_key_pem), black_box(challenge.as_bytes()))
                .expect("sign must succeed")
        })
    });
}

/// Benchmarks signature verification, the follower's per-handshake cost.
fn bench_verify(c: &mut Criterion) {
    let keys = bench_keys();
    let message = canonical_session_message(&generate_challenge(), 1_700_000_300_000, "/peer");
    let signature = sign(&keys.private_key_pem, message.as_bytes()).expect("sign");

    c.bench_function("verify_session_signature", |b| {
        b.iter(|| {
            verify(
                black_box(&keys.public_key_pem),
                black_box(message.as_bytes()),
                black_box(&signature),
            )
        })
    });
}

/// Benchmarks the cheap derivations used on every tick.
fn bench_derivations(c: &mut Criterion) {
    let keys = bench_keys();

    c.bench_function("fingerprint", |b| {
        b.iter(|| fingerprint(black_box(&keys.public_key_pem)))
    });

    c.bench_function("endpoint_key", |b| {
        b.iter(|| {
            endpoint_key(
                black_box("192.168.1.10"),
                black_box(24891),
                black_box(&keys.public_key_pem),
                black_box(Some("1234")),
            )
        })
    });

    c.bench_function("generate_challenge", |b| b.iter(generate_challenge));
}

criterion_group!(benches, bench_sign, bench_verify, bench_derivations);
criterion_main!(benches);
