//! Fixed-size streaming chunker
//!
//! Splits an async byte source into equally sized chunks, the last one
//! possibly shorter. Chunks are produced lazily and in source order; the
//! chunker never holds more than one chunk in memory. Empty input yields no
//! chunks at all.

use bytes::Bytes;
use futures::Stream;
use std::ops::Range;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Smallest buffer growth step when the source outlives its declared length.
const READ_STEP: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum ChunkError {
    #[error("chunk size must be greater than zero")]
    ZeroChunkSize,

    #[error("read failed at offset {offset}: {source}")]
    Read {
        offset: u64,
        #[source]
        source: std::io::Error,
    },
}

/// One plaintext chunk read from the source.
#[derive(Debug, Clone)]
pub struct ContentChunk {
    /// Zero-based position in the source
    pub index: u64,
    /// Byte offset within the source
    pub offset: u64,
    pub data: Bytes,
}

impl ContentChunk {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Lazy fixed-size chunk sequence over an `AsyncRead`.
///
/// Not restartable: the reader is consumed as chunks are pulled.
pub struct FixedChunker<R> {
    reader: R,
    chunk_size: usize,
    next_index: u64,
    offset: u64,
    exhausted: bool,
    /// Declared source length; sizes the buffer of the last chunk.
    len_hint: Option<u64>,
}

impl<R: AsyncRead + Unpin> FixedChunker<R> {
    pub fn new(reader: R, chunk_size: usize) -> Result<Self, ChunkError> {
        if chunk_size == 0 {
            return Err(ChunkError::ZeroChunkSize);
        }
        Ok(Self {
            reader,
            chunk_size,
            next_index: 0,
            offset: 0,
            exhausted: false,
            len_hint: None,
        })
    }

    /// Declare the source length so a short final chunk gets a short buffer.
    /// A wrong hint costs reallocations, never data.
    pub fn with_len_hint(mut self, len: u64) -> Self {
        self.len_hint = Some(len);
        self
    }

    fn initial_buffer(&self) -> usize {
        match self.len_hint {
            Some(len) => {
                let remaining = len.saturating_sub(self.offset);
                remaining.min(self.chunk_size as u64) as usize
            }
            None => self.chunk_size,
        }
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Bytes consumed from the source so far.
    pub fn bytes_read(&self) -> u64 {
        self.offset
    }

    /// Read the next chunk. A short read only ends a chunk at end of input.
    pub async fn next_chunk(&mut self) -> Result<Option<ContentChunk>, ChunkError> {
        if self.exhausted {
            return Ok(None);
        }

        let mut buf = vec![0u8; self.initial_buffer()];
        let mut filled = 0;
        while filled < self.chunk_size {
            if filled == buf.len() {
                // At the declared end: check for EOF before growing.
                let mut peek = [0u8; 1];
                let n = self
                    .reader
                    .read(&mut peek)
                    .await
                    .map_err(|source| ChunkError::Read {
                        offset: self.offset + filled as u64,
                        source,
                    })?;
                if n == 0 {
                    self.exhausted = true;
                    break;
                }
                let grown = (buf.len() * 2).max(READ_STEP).min(self.chunk_size);
                buf.resize(grown, 0);
                buf[filled] = peek[0];
                filled += 1;
                continue;
            }
            let n = self
                .reader
                .read(&mut buf[filled..])
                .await
                .map_err(|source| ChunkError::Read {
                    offset: self.offset + filled as u64,
                    source,
                })?;
            if n == 0 {
                self.exhausted = true;
                break;
            }
            filled += n;
        }

        if filled == 0 {
            return Ok(None);
        }
        buf.truncate(filled);

        let chunk = ContentChunk {
            index: self.next_index,
            offset: self.offset,
            data: Bytes::from(buf),
        };
        self.next_index += 1;
        self.offset += filled as u64;
        tracing::trace!(index = chunk.index, len = filled, "chunk read");
        Ok(Some(chunk))
    }

    /// Convert into a `Stream` of chunks.
    pub fn into_stream(self) -> impl Stream<Item = Result<ContentChunk, ChunkError>> {
        futures::stream::try_unfold(self, |mut chunker| async move {
            Ok(chunker.next_chunk().await?.map(|chunk| (chunk, chunker)))
        })
    }
}

/// Byte ranges of the chunks a `len`-byte input splits into.
pub fn chunk_ranges(len: u64, chunk_size: u64) -> Vec<Range<u64>> {
    if chunk_size == 0 {
        return Vec::new();
    }
    (0..len.div_ceil(chunk_size))
        .map(|i| {
            let start = i * chunk_size;
            start..(start + chunk_size).min(len)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;
    use proptest::prelude::*;

    async fn collect(data: &[u8], chunk_size: usize) -> Vec<ContentChunk> {
        FixedChunker::new(data, chunk_size)
            .unwrap()
            .into_stream()
            .try_collect()
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn empty_input_yields_no_chunks() {
        assert!(collect(&[], 16).await.is_empty());
    }

    #[tokio::test]
    async fn single_byte_yields_one_short_chunk() {
        let chunks = collect(&[7], 16).await;
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].data.as_ref(), &[7]);
    }

    #[tokio::test]
    async fn exact_multiple_has_no_empty_tail() {
        let data = vec![1u8; 64];
        let chunks = collect(&data, 16).await;
        assert_eq!(chunks.len(), 4);
        assert!(chunks.iter().all(|c| c.len() == 16));
    }

    #[tokio::test]
    async fn remainder_goes_in_last_chunk() {
        let data: Vec<u8> = (0..50u8).collect();
        let chunks = collect(&data, 16).await;
        assert_eq!(chunks.len(), 4);
        assert_eq!(chunks[3].len(), 2);
        assert_eq!(chunks[3].offset, 48);
        assert_eq!(chunks[3].index, 3);
    }

    #[tokio::test]
    async fn short_reads_do_not_split_chunks() {
        // Chain of small readers forces the inner read loop to refill
        let data: Vec<u8> = (0..40u8).collect();
        let reader = (&data[..5])
            .chain(&data[5..13])
            .chain(&data[13..33])
            .chain(&data[33..]);
        let chunks: Vec<_> = FixedChunker::new(reader, 16)
            .unwrap()
            .into_stream()
            .try_collect()
            .await
            .unwrap();
        let lens: Vec<_> = chunks.iter().map(|c| c.len()).collect();
        assert_eq!(lens, vec![16, 16, 8]);
    }

    #[tokio::test]
    async fn short_tail_gets_a_short_buffer() {
        let data = vec![3u8; 10];
        let mut chunker = FixedChunker::new(&data[..], 1024 * 1024)
            .unwrap()
            .with_len_hint(10);
        assert_eq!(chunker.initial_buffer(), 10);
        let chunk = chunker.next_chunk().await.unwrap().unwrap();
        assert_eq!(chunk.len(), 10);
        assert_eq!(chunker.initial_buffer(), 0);
        assert!(chunker.next_chunk().await.unwrap().is_none());

        let mut chunker = FixedChunker::new(&data[..], 4).unwrap().with_len_hint(10);
        let mut buffers = vec![chunker.initial_buffer()];
        while chunker.next_chunk().await.unwrap().is_some() {
            buffers.push(chunker.initial_buffer());
        }
        assert_eq!(buffers, vec![4, 4, 2, 0]);
    }

    #[tokio::test]
    async fn wrong_len_hint_loses_nothing() {
        let data: Vec<u8> = (0..40u8).collect();
        for hint in [0, 3, 100] {
            let chunks: Vec<_> = FixedChunker::new(&data[..], 16)
                .unwrap()
                .with_len_hint(hint)
                .into_stream()
                .try_collect()
                .await
                .unwrap();
            let lens: Vec<_> = chunks.iter().map(|c| c.len()).collect();
            assert_eq!(lens, vec![16, 16, 8], "hint {hint}");
            let joined: Vec<u8> = chunks.iter().flat_map(|c| c.data.to_vec()).collect();
            assert_eq!(joined, data);
        }
    }

    #[test]
    fn zero_chunk_size_rejected() {
        assert!(matches!(
            FixedChunker::new(&b""[..], 0),
            Err(ChunkError::ZeroChunkSize)
        ));
    }

    #[test]
    fn chunk_ranges_cover_input() {
        assert_eq!(chunk_ranges(0, 4), vec![]);
        assert_eq!(chunk_ranges(10, 4), vec![0..4, 4..8, 8..10]);
        assert_eq!(chunk_ranges(8, 4), vec![0..4, 4..8]);
    }

    proptest! {
        #[test]
        fn chunks_reassemble_to_input(
            data in proptest::collection::vec(any::<u8>(), 0..=4096),
            chunk_size in 1usize..=512,
        ) {
            let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
            let chunks = rt.block_on(collect(&data, chunk_size));

            let mut joined = Vec::with_capacity(data.len());
            for (i, chunk) in chunks.iter().enumerate() {
                prop_assert_eq!(chunk.index, i as u64);
                prop_assert_eq!(chunk.offset, joined.len() as u64);
                prop_assert!(!chunk.is_empty());
                if i + 1 < chunks.len() {
                    prop_assert_eq!(chunk.len(), chunk_size);
                }
                joined.extend_from_slice(&chunk.data);
            }
            prop_assert_eq!(joined, data);
        }
    }
}
