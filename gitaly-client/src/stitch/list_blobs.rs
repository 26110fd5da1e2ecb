use super::blobs::{Blob, PartialBlob};
use super::{Assembler, StitchError};
use bytes::Bytes;
use std::collections::VecDeque;

/// One chunk inside a `ListBlobs` message.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ListBlobsChunk {
    pub oid: String,
    pub size: i64,
    pub data: Bytes,
    pub path: Vec<u8>,
}

/// A `ListBlobs` message carries a batch of chunks. A blob may continue
/// into the next message.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ListBlobsResponse {
    pub blobs: Vec<ListBlobsChunk>,
}

#[derive(Debug, Default)]
pub struct ListBlobsAssembler {
    current: Option<PartialBlob>,
}

impl ListBlobsAssembler {
    pub fn new() -> Self {
        ListBlobsAssembler::default()
    }

    fn push_chunk(&mut self, chunk: ListBlobsChunk, out: &mut VecDeque<Result<Blob, StitchError>>) {
        if chunk.oid.is_empty() {
            match self.current.as_mut() {
                Some(blob) => blob.extend(&chunk.data),
                None if chunk.data.is_empty() => {}
                None => out.push_back(Err(StitchError::OrphanChunk { kind: "list_blobs" })),
            }
            return;
        }

        if let Some(done) = self.current.take() {
            out.push_back(Ok(done.build()));
        }
        self.current = Some(PartialBlob::new(
            chunk.oid,
            &chunk.path,
            chunk.size,
            None,
            None,
            &chunk.data,
        ));
    }
}

impl Assembler for ListBlobsAssembler {
    type Message = ListBlobsResponse;
    type Output = Blob;

    fn push(&mut self, message: ListBlobsResponse, out: &mut VecDeque<Result<Blob, StitchError>>) {
        for chunk in message.blobs {
            self.push_chunk(chunk, out);
        }
    }

    fn finish(&mut self) -> Option<Blob> {
        self.current.take().map(PartialBlob::build)
    }
}
