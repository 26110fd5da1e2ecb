//! Reassembly of objects that the server splits across several messages.
//!
//! Each kind of response gets an [`Assembler`] holding at most one object
//! in progress. [`Stitched`] drives an assembler over a message stream and
//! yields objects as soon as their boundary is seen: a terminal flag, the
//! start of the next object, or the end of the stream.

pub mod blobs;
pub mod conflict_files;
pub mod diff_blobs;
pub mod diffs;
pub mod list_blobs;

pub use blobs::{Blob, BlobAssembler, GetBlobsResponse};
pub use conflict_files::{
    ConflictFile, ConflictFileAssembler, ConflictFileHeader, ConflictFilePart,
    ListConflictFilesResponse,
};
pub use diff_blobs::{DiffBlob, DiffBlobAssembler, DiffBlobsResponse, PatchStatus};
pub use diffs::{CommitDiffResponse, Diff, DiffAssembler};
pub use list_blobs::{ListBlobsAssembler, ListBlobsChunk, ListBlobsResponse};

use crate::errors::TransportError;
use crate::transport::MessageStream;
use futures_util::Stream;
use std::collections::VecDeque;
use std::pin::Pin;
use std::task::{Context, Poll};

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum StitchError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// A continuation arrived with no object in progress. The fragment is dropped.
    #[error("received a {kind} continuation chunk before any start chunk")]
    OrphanChunk { kind: &'static str },
}

/// Per-kind boundary detection and accumulation.
pub trait Assembler {
    type Message;
    type Output;

    /// Consumes one message, pushing every object it completes onto `out`.
    fn push(&mut self, message: Self::Message, out: &mut VecDeque<Result<Self::Output, StitchError>>);

    /// Returns the object still in progress once the input has ended.
    fn finish(&mut self) -> Option<Self::Output>;
}

/// Stream of stitched objects. Single pass: once it has returned `None` it
/// keeps returning `None`.
pub struct Stitched<A: Assembler> {
    messages: MessageStream<A::Message>,
    assembler: A,
    ready: VecDeque<Result<A::Output, StitchError>>,
    done: bool,
}

impl<A: Assembler> Stitched<A> {
    pub fn new(messages: MessageStream<A::Message>, assembler: A) -> Self {
        Stitched {
            messages,
            assembler,
            ready: VecDeque::new(),
            done: false,
        }
    }
}

impl<A> Stream for Stitched<A>
where
    A: Assembler + Unpin,
    A::Output: Unpin,
{
    type Item = Result<A::Output, StitchError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        loop {
            if let Some(item) = this.ready.pop_front() {
                return Poll::Ready(Some(item));
            }
            if this.done {
                return Poll::Ready(None);
            }

            match this.messages.as_mut().poll_next(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Some(Ok(message))) => this.assembler.push(message, &mut this.ready),
                Poll::Ready(Some(Err(e))) => {
                    // The partial object is incomplete and is discarded
                    this.done = true;
                    this.assembler.finish();
                    return Poll::Ready(Some(Err(e.into())));
                }
                Poll::Ready(None) => {
                    this.done = true;
                    if let Some(last) = this.assembler.finish() {
                        this.ready.push_back(Ok(last));
                    }
                }
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::{Code, Status};
    use bytes::Bytes;
    use futures_util::StreamExt;
    use futures_util::stream;

    /// Numbers are starts, zero terminates the current object.
    #[derive(Default)]
    struct Sums {
        current: Option<u32>,
    }

    impl Assembler for Sums {
        type Message = u32;
        type Output = u32;

        fn push(&mut self, message: u32, out: &mut VecDeque<Result<u32, StitchError>>) {
            match (message, self.current.take()) {
                (0, Some(sum)) => out.push_back(Ok(sum)),
                (0, None) => out.push_back(Err(StitchError::OrphanChunk { kind: "sum" })),
                (n, Some(sum)) => self.current = Some(sum + n),
                (n, None) => self.current = Some(n),
            }
        }

        fn finish(&mut self) -> Option<u32> {
            self.current.take()
        }
    }

    #[tokio::test]
    async fn test_flushes_on_end() {
        let stitched = test_helpers::collect(Sums::default(), vec![1, 2, 0, 5, 5]).await;
        assert_eq!(stitched, vec![Ok(3), Ok(10)]);
    }

    #[tokio::test]
    async fn test_transport_error_stops_stream() {
        let error: TransportError = Status::new(Code::Internal, "boom").into();
        let messages = stream::iter(vec![Ok(1), Ok(0), Ok(4), Err(error.clone()), Ok(9)]).boxed();

        let mut stitched = Stitched::new(messages, Sums::default());
        assert_eq!(stitched.next().await, Some(Ok(1)));
        assert_eq!(stitched.next().await, Some(Err(StitchError::Transport(error))));
        assert_eq!(stitched.next().await, None);
        assert_eq!(stitched.next().await, None);
    }

    #[tokio::test]
    async fn test_orphan_chunk_continues() {
        let stitched = test_helpers::collect(Sums::default(), vec![0, 2, 0]).await;
        assert_eq!(
            stitched,
            vec![Err(StitchError::OrphanChunk { kind: "sum" }), Ok(2)]
        );
    }

    const PAYLOADS: [&[u8]; 5] = [b"x", b"hello world", b"", b"0123456789abcdef", b"yz"];

    /// Splits `payload` into `size`-byte fragments. Empty payloads still take one message.
    fn fragments(payload: &'static [u8], size: usize) -> Vec<Bytes> {
        if payload.is_empty() {
            return vec![Bytes::new()];
        }
        payload.chunks(size).map(Bytes::from_static).collect()
    }

    fn fragment_sizes() -> std::ops::RangeInclusive<usize> {
        let longest = PAYLOADS.iter().map(|p| p.len()).max().unwrap_or(0);
        1..=longest + 1
    }

    fn expected() -> Vec<Bytes> {
        PAYLOADS.into_iter().map(Bytes::from_static).collect()
    }

    #[tokio::test]
    async fn test_blobs_at_every_fragment_size() {
        for size in fragment_sizes() {
            let mut messages = Vec::new();
            for (i, payload) in PAYLOADS.into_iter().enumerate() {
                for (n, data) in fragments(payload, size).into_iter().enumerate() {
                    messages.push(match n {
                        0 => GetBlobsResponse {
                            oid: format!("oid{i}"),
                            path: format!("dir/file{i}").into_bytes(),
                            size: payload.len() as i64,
                            data,
                            ..GetBlobsResponse::default()
                        },
                        _ => GetBlobsResponse {
                            data,
                            ..GetBlobsResponse::default()
                        },
                    });
                }
            }

            let blobs: Vec<Blob> = test_helpers::collect(BlobAssembler::new(), messages)
                .await
                .into_iter()
                .map(Result::unwrap)
                .collect();

            let ids: Vec<String> = (0..PAYLOADS.len()).map(|i| format!("oid{i}")).collect();
            assert_eq!(blobs.iter().map(|b| b.id.clone()).collect::<Vec<_>>(), ids, "size {size}");
            assert_eq!(
                blobs.into_iter().map(|b| b.data).collect::<Vec<_>>(),
                expected(),
                "size {size}"
            );
        }
    }

    #[tokio::test]
    async fn test_conflict_files_at_every_fragment_size() {
        for size in fragment_sizes() {
            let mut parts = Vec::new();
            for (i, payload) in PAYLOADS.into_iter().enumerate() {
                for (n, content) in fragments(payload, size).into_iter().enumerate() {
                    let header = (n == 0).then(|| ConflictFileHeader {
                        commit_oid: "abc123".into(),
                        their_path: format!("file{i}").into_bytes(),
                        our_path: format!("file{i}").into_bytes(),
                        our_mode: 0o100644,
                        ancestor_path: Vec::new(),
                    });
                    parts.push(ConflictFilePart { header, content });
                }
            }

            // Parts are packed two per message so files cross message boundaries
            let messages: Vec<ListConflictFilesResponse> = parts
                .chunks(2)
                .map(|files| ListConflictFilesResponse {
                    files: files.to_vec(),
                })
                .collect();

            let files: Vec<ConflictFile> = test_helpers::collect(ConflictFileAssembler::new(), messages)
                .await
                .into_iter()
                .map(Result::unwrap)
                .collect();

            let paths: Vec<String> = (0..PAYLOADS.len()).map(|i| format!("file{i}")).collect();
            assert_eq!(files.iter().map(|f| f.our_path.clone()).collect::<Vec<_>>(), paths, "size {size}");
            assert_eq!(
                files.into_iter().map(|f| f.content).collect::<Vec<_>>(),
                expected(),
                "size {size}"
            );
        }
    }

    #[tokio::test]
    async fn test_diff_blobs_at_every_fragment_size() {
        for size in fragment_sizes() {
            let mut messages = Vec::new();
            for (i, payload) in PAYLOADS.into_iter().enumerate() {
                let patches = fragments(payload, size);
                let last = patches.len() - 1;
                for (n, patch) in patches.into_iter().enumerate() {
                    let status = if n == last {
                        PatchStatus::EndOfPatch
                    } else {
                        PatchStatus::Incomplete
                    };
                    let (left_blob_id, right_blob_id) = match n {
                        0 => (format!("left{i}"), format!("right{i}")),
                        _ => (String::new(), String::new()),
                    };
                    messages.push(DiffBlobsResponse {
                        left_blob_id,
                        right_blob_id,
                        patch,
                        status,
                        ..DiffBlobsResponse::default()
                    });
                }
            }

            let diffs: Vec<DiffBlob> = test_helpers::collect(DiffBlobAssembler::new(), messages)
                .await
                .into_iter()
                .map(Result::unwrap)
                .collect();

            let ids: Vec<String> = (0..PAYLOADS.len()).map(|i| format!("left{i}")).collect();
            assert_eq!(diffs.iter().map(|d| d.left_blob_id.clone()).collect::<Vec<_>>(), ids, "size {size}");
            assert!(diffs.iter().all(|d| d.status == PatchStatus::EndOfPatch));
            assert_eq!(
                diffs.into_iter().map(|d| d.patch).collect::<Vec<_>>(),
                expected(),
                "size {size}"
            );
        }
    }

    #[tokio::test]
    async fn test_diffs_at_every_fragment_size() {
        for size in fragment_sizes() {
            let mut messages = Vec::new();
            for (i, payload) in PAYLOADS.into_iter().enumerate() {
                let patches = fragments(payload, size);
                let last = patches.len() - 1;
                for (n, raw_patch_data) in patches.into_iter().enumerate() {
                    let path = match n {
                        0 => format!("file{i}").into_bytes(),
                        _ => Vec::new(),
                    };
                    messages.push(CommitDiffResponse {
                        from_path: path.clone(),
                        to_path: path,
                        raw_patch_data,
                        end_of_patch: n == last,
                        ..CommitDiffResponse::default()
                    });
                }
            }

            let diffs: Vec<Diff> = test_helpers::collect(DiffAssembler::new(), messages)
                .await
                .into_iter()
                .map(Result::unwrap)
                .collect();

            let paths: Vec<String> = (0..PAYLOADS.len()).map(|i| format!("file{i}")).collect();
            assert_eq!(diffs.iter().map(|d| d.to_path.clone()).collect::<Vec<_>>(), paths, "size {size}");
            assert_eq!(
                diffs.into_iter().map(|d| d.patch).collect::<Vec<_>>(),
                expected(),
                "size {size}"
            );
        }
    }
}
