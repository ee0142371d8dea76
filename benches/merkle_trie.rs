//! Merkle trie performance benchmarks.
//!
//! Measures the cost of the three hot paths: committing batches of staged
//! writes (which includes the bottom-up digest recomputation), point reads
//! through the node cache, and range proof generation plus verification.
//!
//! ```bash
//! cargo bench --bench merkle_trie
//! ```

use criterion::{criterion_group, criterion_main, Criterion};
use merkledb::{BatchOp, CancelToken, Config, MemStore, MerkleDb};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::hint::black_box;

/// Generate `count` random key/value pairs with 32-byte keys and values.
fn gen_pairs(count: usize, rng: &mut StdRng) -> Vec<(Vec<u8>, Vec<u8>)> {
    (0..count)
        .map(|_| {
            let key: [u8; 32] = rng.gen();
            let value: [u8; 32] = rng.gen();
            (key.to_vec(), value.to_vec())
        })
        .collect()
}

fn populated_db(pairs: &[(Vec<u8>, Vec<u8>)]) -> MerkleDb<MemStore> {
    let db = MerkleDb::new(MemStore::new(), Config::default()).expect("open db");
    let ops = pairs
        .iter()
        .map(|(key, value)| BatchOp::put(key.clone(), value.clone()))
        .collect();
    db.new_untracked_view(ops)
        .expect("create view")
        .commit_to_db(&CancelToken::new())
        .expect("commit");
    db
}

fn bench_commit(c: &mut Criterion) {
    let mut rng = StdRng::seed_from_u64(17);
    for size in [100usize, 1_000] {
        let pairs = gen_pairs(size, &mut rng);
        c.bench_function(&format!("commit_{size}_keys"), |b| {
            b.iter(|| {
                let db = populated_db(&pairs);
                black_box(db.get_merkle_root(&CancelToken::new()).expect("root"));
            });
        });
    }
}

fn bench_get(c: &mut Criterion) {
    let mut rng = StdRng::seed_from_u64(18);
    let pairs = gen_pairs(1_000, &mut rng);
    let db = populated_db(&pairs);
    let cancel = CancelToken::new();
    c.bench_function("get_cached_key", |b| {
        let mut i = 0usize;
        b.iter(|| {
            let (key, _) = &pairs[i % pairs.len()];
            i += 1;
            black_box(db.get(key, &cancel).expect("present"));
        });
    });
}

fn bench_range_proof(c: &mut Criterion) {
    let mut rng = StdRng::seed_from_u64(19);
    let pairs = gen_pairs(1_000, &mut rng);
    let db = populated_db(&pairs);
    let cancel = CancelToken::new();
    let root = db.get_merkle_root(&cancel).expect("root");

    c.bench_function("range_proof_generate_100", |b| {
        b.iter(|| {
            black_box(db.get_range_proof(None, None, 100, &cancel).expect("proof"));
        });
    });

    let proof = db.get_range_proof(None, None, 100, &cancel).expect("proof");
    c.bench_function("range_proof_verify_100", |b| {
        b.iter(|| {
            proof.verify(None, None, root).expect("valid proof");
        });
    });
}

criterion_group!(benches, bench_commit, bench_get, bench_range_proof);
criterion_main!(benches);
