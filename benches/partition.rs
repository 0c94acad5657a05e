use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, SamplingMode, Throughput};
use uuid::Uuid;

use dam::policy::{Action, Policy, PolicyStore};
use dam::tree::{partition, ResourceTree};

/// `buckets` top-level nodes, each with `dirs` directories of `files` files.
fn synthetic_paths(buckets: usize, dirs: usize, files: usize) -> Vec<String> {
    let mut out = Vec::with_capacity(buckets * dirs * files);
    for b in 0..buckets {
        for d in 0..dirs {
            for f in 0..files {
                out.push(format!("bucket{}/dir{}/file{}.bin", b, d, f));
            }
        }
    }
    out
}

fn bench_build(c: &mut Criterion) {
    let mut group = c.benchmark_group("tree_build");
    group.sampling_mode(SamplingMode::Flat);
    for &files in &[10usize, 100] {
        let paths = synthetic_paths(10, 20, files);
        group.throughput(Throughput::Elements(paths.len() as u64));
        group.bench_with_input(BenchmarkId::new("build", paths.len()), &paths, |b, paths| {
            b.iter(|| criterion::black_box(ResourceTree::build(paths, "/")));
        });
    }
    group.finish();
}

fn bench_partition(c: &mut Criterion) {
    let tmp = tempfile::tempdir().unwrap();
    let store = PolicyStore::open(tmp.path()).unwrap();
    let subject = Uuid::new_v4();
    let endpoint = Uuid::new_v4();
    store.create_subject_store(&subject).unwrap();

    let paths = synthetic_paths(10, 20, 100);
    let tree = ResourceTree::build(&paths, "/");
    // grant every 7th file for read and every 50th for write
    for (i, p) in paths.iter().enumerate() {
        if i % 7 == 0 { store.add(Policy::new(subject, endpoint, p.clone(), Action::Read)).unwrap(); }
        if i % 50 == 0 { store.add(Policy::new(subject, endpoint, p.clone(), Action::Write)).unwrap(); }
    }

    let mut group = c.benchmark_group("partition");
    group.sampling_mode(SamplingMode::Flat);
    group.sample_size(30);
    group.throughput(Throughput::Elements(tree.len() as u64));
    for actions in [vec![Action::Read], vec![Action::Read, Action::Write], Action::ALL.to_vec()] {
        group.bench_with_input(BenchmarkId::new("policy_store", actions.len()), &actions, |b, actions| {
            b.iter(|| {
                let parts = partition(&tree, |n, a| store.enforce(&subject, &endpoint, &n.id, a), actions);
                criterion::black_box(parts)
            });
        });
    }
    group.bench_function("closure_only", |b| {
        b.iter(|| criterion::black_box(partition(&tree, |n, _| n.tag.ends_with("7.bin"), &[Action::Read])))
    });
    group.finish();
}

criterion_group!(benches, bench_build, bench_partition);
criterion_main!(benches);
