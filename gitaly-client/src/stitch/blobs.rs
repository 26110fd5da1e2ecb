use super::{Assembler, StitchError};
use bytes::{Bytes, BytesMut};
use std::collections::VecDeque;

/// Bytes inspected when classifying content as binary.
const BINARY_SNIFF_LEN: usize = 8000;

/// One `GetBlobs` message. Only the first message of a blob carries an oid.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct GetBlobsResponse {
    pub oid: String,
    pub size: i64,
    pub data: Bytes,
    pub path: Vec<u8>,
    pub revision: String,
    pub mode: i32,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Blob {
    pub id: String,
    /// Last path segment
    pub name: String,
    pub path: String,
    pub size: i64,
    pub data: Bytes,
    /// Octal, e.g. `100644`
    pub mode: Option<String>,
    pub commit_id: Option<String>,
    pub binary: bool,
}

/// Whether `data` looks like binary content.
pub fn is_binary(data: &[u8]) -> bool {
    data[..data.len().min(BINARY_SNIFF_LEN)].contains(&0)
}

pub(crate) fn basename(path: &str) -> String {
    path.rsplit('/').next().unwrap_or(path).to_string()
}

pub(crate) fn octal_mode(mode: i32) -> Option<String> {
    (mode > 0).then(|| format!("{mode:o}"))
}

/// Blob under construction, shared with the list-blobs adapter.
#[derive(Debug)]
pub(crate) struct PartialBlob {
    id: String,
    path: String,
    size: i64,
    mode: Option<String>,
    commit_id: Option<String>,
    data: BytesMut,
}

impl PartialBlob {
    pub(crate) fn new(
        id: String,
        path: &[u8],
        size: i64,
        mode: Option<String>,
        commit_id: Option<String>,
        data: &[u8],
    ) -> Self {
        PartialBlob {
            id,
            path: String::from_utf8_lossy(path).into_owned(),
            size,
            mode,
            commit_id,
            data: BytesMut::from(data),
        }
    }

    pub(crate) fn extend(&mut self, data: &[u8]) {
        self.data.extend_from_slice(data);
    }

    pub(crate) fn build(self) -> Blob {
        let data = self.data.freeze();

        Blob {
            name: basename(&self.path),
            binary: is_binary(&data),
            id: self.id,
            path: self.path,
            size: self.size,
            data,
            mode: self.mode,
            commit_id: self.commit_id,
        }
    }
}

#[derive(Debug, Default)]
pub struct BlobAssembler {
    current: Option<PartialBlob>,
}

impl BlobAssembler {
    pub fn new() -> Self {
        BlobAssembler::default()
    }
}

impl Assembler for BlobAssembler {
    type Message = GetBlobsResponse;
    type Output = Blob;

    fn push(&mut self, message: GetBlobsResponse, out: &mut VecDeque<Result<Blob, StitchError>>) {
        if message.oid.is_empty() && message.data.is_empty() {
            return;
        }

        if !message.oid.is_empty() {
            if let Some(done) = self.current.take() {
                out.push_back(Ok(done.build()));
            }

            self.current = Some(PartialBlob::new(
                message.oid,
                &message.path,
                message.size,
                octal_mode(message.mode),
                Some(message.revision).filter(|r| !r.is_empty()),
                &message.data,
            ));
            return;
        }

        match self.current.as_mut() {
            Some(blob) => blob.extend(&message.data),
            None => out.push_back(Err(StitchError::OrphanChunk { kind: "blob" })),
        }
    }

    fn finish(&mut self) -> Option<Blob> {
        self.current.take().map(PartialBlob::build)
    }
}
