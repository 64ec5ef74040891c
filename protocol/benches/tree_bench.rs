// Merkle tree and bitfield benchmarks for Strata.
//
// Covers appending batches of blocks, building block proofs against a large
// tree, verifying those proofs the way a reader does on download, and
// scanning a sparse bitfield for missing blocks.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use strata_protocol::storage::{Bitfield, LogDb};
use strata_protocol::tree::{verify_block, MerkleTree};

fn filled_tree(db: &LogDb, blocks: u64) -> MerkleTree {
    let mut tree = MerkleTree::open(db.node_region(), None, 0).unwrap();
    let data: Vec<Vec<u8>> = (0..blocks).map(|i| i.to_le_bytes().repeat(64)).collect();
    tree.append(data.as_slice()).unwrap();
    tree
}

fn bench_append(c: &mut Criterion) {
    let mut group = c.benchmark_group("tree/append");

    for batch in [1u64, 16, 256] {
        let data: Vec<Vec<u8>> = (0..batch).map(|i| vec![i as u8; 1024]).collect();
        group.throughput(Throughput::Elements(batch));
        group.bench_with_input(BenchmarkId::from_parameter(batch), &data, |b, data| {
            let db = LogDb::open_temporary().unwrap();
            let mut tree = MerkleTree::open(db.node_region(), None, 0).unwrap();
            b.iter(|| tree.append(data.as_slice()).unwrap());
        });
    }

    group.finish();
}

fn bench_proof(c: &mut Criterion) {
    let db = LogDb::open_temporary().unwrap();
    let tree = filled_tree(&db, 4096);

    c.bench_function("tree/proof_4096", |b| {
        let mut index = 0u64;
        b.iter(|| {
            index = (index + 997) % 4096;
            tree.proof(index).unwrap()
        });
    });
}

fn bench_verify(c: &mut Criterion) {
    let db = LogDb::open_temporary().unwrap();
    let tree = filled_tree(&db, 4096);
    let index = 1234u64;
    let data = index.to_le_bytes().repeat(64);
    let proof = tree.proof(index).unwrap();
    let roots = tree.roots().to_vec();

    c.bench_function("tree/verify_block_4096", |b| {
        b.iter(|| verify_block(index, &data, &proof, &roots).unwrap());
    });
}

fn bench_bitfield_scan(c: &mut Criterion) {
    let mut bits = Bitfield::in_memory();
    for i in (0..1_000_000u64).step_by(3) {
        bits.set(i, true);
    }

    c.bench_function("bitfield/first_unset_1m", |b| {
        b.iter(|| bits.first_unset(0, 1_000_000));
    });
    c.bench_function("bitfield/count_ones_1m", |b| {
        b.iter(|| bits.count_ones(0, 1_000_000));
    });
}

criterion_group!(benches, bench_append, bench_proof, bench_verify, bench_bitfield_scan);
criterion_main!(benches);
