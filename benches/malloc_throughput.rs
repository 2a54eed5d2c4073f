use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use std::hint::black_box;

const OPS: u64 = 100_000;
const BATCH: usize = 64;

/// segmalloc alloc/free throughput.
fn segmalloc_malloc_free(size: usize) {
  for _ in 0..OPS {
    unsafe {
      let ptr = segmalloc::allocate(size);
      black_box(ptr);
      segmalloc::deallocate(ptr, size);
    }
  }
}

/// libc alloc/free throughput.
fn libc_malloc_free(size: usize) {
  for _ in 0..OPS {
    unsafe {
      let ptr = libc::malloc(size);
      black_box(ptr);
      libc::free(ptr);
    }
  }
}

/// Allocates in batches so frees hit pages that are not the queue head.
fn segmalloc_batched(size: usize) {
  let mut live = [core::ptr::null_mut(); BATCH];
  for _ in 0..OPS / BATCH as u64 {
    for slot in &mut live {
      *slot = segmalloc::allocate(size);
    }
    for &ptr in live.iter().rev() {
      unsafe { segmalloc::deallocate(black_box(ptr), size) };
    }
  }
}

fn libc_batched(size: usize) {
  let mut live = [core::ptr::null_mut(); BATCH];
  for _ in 0..OPS / BATCH as u64 {
    for slot in &mut live {
      *slot = unsafe { libc::malloc(size) };
    }
    for &ptr in live.iter().rev() {
      unsafe { libc::free(black_box(ptr)) };
    }
  }
}

fn benchmark_malloc_throughput(c: &mut Criterion) {
  let mut group = c.benchmark_group("malloc_throughput");

  for size in [16, 64, 256, 1024, 4096, 65536] {
    group.throughput(Throughput::Elements(OPS));

    group.bench_with_input(BenchmarkId::new("segmalloc", size), &size, |b, &size| {
      b.iter(|| segmalloc_malloc_free(size))
    });

    group.bench_with_input(BenchmarkId::new("libc", size), &size, |b, &size| {
      b.iter(|| libc_malloc_free(size))
    });
  }

  group.finish();

  let mut group = c.benchmark_group("malloc_batched");
  for size in [32, 512, 8192] {
    group.throughput(Throughput::Elements(OPS));

    group.bench_with_input(BenchmarkId::new("segmalloc", size), &size, |b, &size| {
      b.iter(|| segmalloc_batched(size))
    });

    group.bench_with_input(BenchmarkId::new("libc", size), &size, |b, &size| {
      b.iter(|| libc_batched(size))
    });
  }
  group.finish();
}

criterion_group!(benches, benchmark_malloc_throughput);
criterion_main!(benches);
