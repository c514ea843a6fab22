use ipvault_chunks::{chunk_ranges, hash_bytes, sha256_hex, FixedChunker};

fn make_data(size: usize) -> Vec<u8> {
    // Semi-realistic data: repeating pattern with some entropy
    (0..size)
        .map(|i| (i.wrapping_mul(7) ^ (i >> 3)) as u8)
        .collect()
}

#[divan::bench(args = [65536, 1048576, 10485760])]
fn fixed_chunk(bencher: divan::Bencher, size: usize) {
    let data = make_data(size);
    let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
    bencher
        .counter(divan::counter::BytesCount::new(size))
        .bench(|| {
            rt.block_on(async {
                let mut chunker = FixedChunker::new(divan::black_box(&data[..]), 1024 * 1024).unwrap();
                while let Some(chunk) = chunker.next_chunk().await.unwrap() {
                    divan::black_box(chunk);
                }
            })
        });
}

#[divan::bench(args = [1024, 65536, 1048576, 10485760])]
fn blake3_hash(bencher: divan::Bencher, size: usize) {
    let data = make_data(size);
    bencher
        .counter(divan::counter::BytesCount::new(size))
        .bench(|| hash_bytes(divan::black_box(&data)));
}

#[divan::bench(args = [1024, 65536, 1048576, 10485760])]
fn sha256_file_hash(bencher: divan::Bencher, size: usize) {
    let data = make_data(size);
    bencher
        .counter(divan::counter::BytesCount::new(size))
        .bench(|| sha256_hex(divan::black_box(&data)));
}

#[divan::bench(args = [10485760])]
fn plan_ranges(bencher: divan::Bencher, size: usize) {
    bencher.bench(|| chunk_ranges(divan::black_box(size as u64), 4096));
}

fn main() {
    divan::main();
}
