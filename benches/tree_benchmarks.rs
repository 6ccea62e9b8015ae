use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use ethers::types::Address;
use pasta_curves::pallas;
use zkp_group_credentials::{
    bloom::{BloomFilter, SipKeys},
    ethereum::address_to_leaf,
    hasher::HashFunction,
    merkle::{MerkleTree, SparseTree},
    utils::poseidon_hash,
    Node,
};

fn addresses(count: usize) -> Vec<Address> {
    let mut addresses: Vec<Address> = (0..count as u64)
        .map(|i| Address::from_low_u64_be(i + 1))
        .collect();
    addresses.sort();
    addresses
}

fn leaves(count: usize) -> Vec<Node> {
    addresses(count).iter().map(address_to_leaf).collect()
}

fn bench_tree_construction(c: &mut Criterion) {
    let mut group = c.benchmark_group("tree_construction");

    for hash in [HashFunction::Sha3_256, HashFunction::Keccak256, HashFunction::Poseidon] {
        for leaf_count in [16, 256, 1024].iter() {
            let leaves = leaves(*leaf_count);
            group.bench_with_input(
                BenchmarkId::new(hash.to_string(), leaf_count),
                leaf_count,
                |b, _| b.iter(|| black_box(MerkleTree::build(&hash, 16, black_box(&leaves)).unwrap())),
            );
        }
    }

    group.finish();
}

fn bench_sparse_proof(c: &mut Criterion) {
    let mut group = c.benchmark_group("sparse_proof");

    for leaf_count in [16, 256, 4096].iter() {
        let leaves = leaves(*leaf_count);
        let tree = MerkleTree::build(&HashFunction::Sha3_256, 16, &leaves).unwrap();
        let sparse = SparseTree::from_layers(&HashFunction::Sha3_256, tree.indexed_layers()).unwrap();
        let target = leaves[leaf_count / 2];

        group.bench_with_input(
            BenchmarkId::from_parameter(leaf_count),
            leaf_count,
            |b, _| b.iter(|| black_box(sparse.proof_for(black_box(&target)).unwrap())),
        );
    }

    group.finish();
}

fn bench_bloom(c: &mut Criterion) {
    let members = addresses(10_000);
    let (num_bits, num_hashes) = BloomFilter::optimal_params(members.len(), 0.01).unwrap();

    c.bench_function("bloom_build_10k", |b| {
        b.iter(|| {
            black_box(
                BloomFilter::for_addresses(&members, num_bits, num_hashes, SipKeys::new(1, 2))
                    .unwrap(),
            )
        })
    });

    let filter = BloomFilter::for_addresses(&members, num_bits, num_hashes, SipKeys::new(1, 2)).unwrap();
    let outsider = Address::repeat_byte(0x5a);
    c.bench_function("bloom_contains", |b| {
        b.iter(|| black_box(filter.contains_address(black_box(&outsider))))
    });
}

fn bench_poseidon_hash(c: &mut Criterion) {
    c.bench_function("poseidon_hash", |b| {
        b.iter(|| {
            black_box(poseidon_hash(
                black_box(pallas::Base::from(42)),
                black_box(pallas::Base::from(99)),
            ))
        })
    });
}

criterion_group!(
    benches,
    bench_tree_construction,
    bench_sparse_proof,
    bench_bloom,
    bench_poseidon_hash
);
criterion_main!(benches);
