use super::{Assembler, StitchError};
use bytes::{Bytes, BytesMut};
use std::collections::VecDeque;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PatchStatus {
    #[default]
    Incomplete,
    EndOfPatch,
}

/// One `DiffBlobs` message.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DiffBlobsResponse {
    pub left_blob_id: String,
    pub right_blob_id: String,
    pub patch: Bytes,
    pub status: PatchStatus,
    pub binary: bool,
    pub over_patch_bytes_limit: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub struct DiffBlob {
    pub left_blob_id: String,
    pub right_blob_id: String,
    pub patch: Bytes,
    /// Status of the last message of this diff
    pub status: PatchStatus,
    pub binary: bool,
    pub over_patch_bytes_limit: bool,
}

#[derive(Debug)]
struct PartialDiffBlob {
    first: DiffBlobsResponse,
    patch: BytesMut,
    status: PatchStatus,
}

impl PartialDiffBlob {
    fn build(self) -> DiffBlob {
        DiffBlob {
            left_blob_id: self.first.left_blob_id,
            right_blob_id: self.first.right_blob_id,
            patch: self.patch.freeze(),
            status: self.status,
            binary: self.first.binary,
            over_patch_bytes_limit: self.first.over_patch_bytes_limit,
        }
    }
}

#[derive(Debug, Default)]
pub struct DiffBlobAssembler {
    current: Option<PartialDiffBlob>,
}

impl DiffBlobAssembler {
    pub fn new() -> Self {
        DiffBlobAssembler::default()
    }
}

impl Assembler for DiffBlobAssembler {
    type Message = DiffBlobsResponse;
    type Output = DiffBlob;

    fn push(&mut self, message: DiffBlobsResponse, out: &mut VecDeque<Result<DiffBlob, StitchError>>) {
        let status = message.status;

        match self.current.as_mut() {
            Some(partial) => {
                partial.patch.extend_from_slice(&message.patch);
                partial.status = status;
            }
            None if message == DiffBlobsResponse::default() => return,
            None => {
                self.current = Some(PartialDiffBlob {
                    patch: BytesMut::from(&message.patch[..]),
                    status,
                    first: message,
                });
            }
        }

        if status == PatchStatus::EndOfPatch {
            if let Some(done) = self.current.take() {
                out.push_back(Ok(done.build()));
            }
        }
    }

    fn finish(&mut self) -> Option<DiffBlob> {
        self.current.take().map(PartialDiffBlob::build)
    }
}
