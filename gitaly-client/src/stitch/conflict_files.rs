use super::{Assembler, StitchError};
use bytes::{Bytes, BytesMut};
use std::collections::VecDeque;

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ConflictFileHeader {
    pub commit_oid: String,
    pub their_path: Vec<u8>,
    pub our_path: Vec<u8>,
    pub our_mode: i32,
    pub ancestor_path: Vec<u8>,
}

/// Either the header that starts a file or a piece of its content.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ConflictFilePart {
    pub header: Option<ConflictFileHeader>,
    pub content: Bytes,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ListConflictFilesResponse {
    pub files: Vec<ConflictFilePart>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ConflictFile {
    pub commit_oid: String,
    pub their_path: String,
    pub our_path: String,
    pub our_mode: i32,
    pub ancestor_path: Option<String>,
    pub content: Bytes,
}

#[derive(Debug)]
struct PartialConflictFile {
    header: ConflictFileHeader,
    content: BytesMut,
}

impl PartialConflictFile {
    fn build(self) -> ConflictFile {
        let lossy = |bytes: &[u8]| String::from_utf8_lossy(bytes).into_owned();

        ConflictFile {
            their_path: lossy(&self.header.their_path),
            our_path: lossy(&self.header.our_path),
            ancestor_path: Some(lossy(&self.header.ancestor_path)).filter(|p| !p.is_empty()),
            commit_oid: self.header.commit_oid,
            our_mode: self.header.our_mode,
            content: self.content.freeze(),
        }
    }
}

/// Files have no terminal flag: a file ends when the next header arrives
/// or the stream ends.
#[derive(Debug, Default)]
pub struct ConflictFileAssembler {
    current: Option<PartialConflictFile>,
}

impl ConflictFileAssembler {
    pub fn new() -> Self {
        ConflictFileAssembler::default()
    }

    fn push_part(
        &mut self,
        part: ConflictFilePart,
        out: &mut VecDeque<Result<ConflictFile, StitchError>>,
    ) {
        if let Some(header) = part.header {
            if let Some(done) = self.current.take() {
                out.push_back(Ok(done.build()));
            }
            self.current = Some(PartialConflictFile {
                header,
                content: BytesMut::from(&part.content[..]),
            });
            return;
        }

        match self.current.as_mut() {
            Some(file) => file.content.extend_from_slice(&part.content),
            None if part.content.is_empty() => {}
            None => out.push_back(Err(StitchError::OrphanChunk {
                kind: "conflict_file",
            })),
        }
    }
}

impl Assembler for ConflictFileAssembler {
    type Message = ListConflictFilesResponse;
    type Output = ConflictFile;

    fn push(
        &mut self,
        message: ListConflictFilesResponse,
        out: &mut VecDeque<Result<ConflictFile, StitchError>>,
    ) {
        for part in message.files {
            self.push_part(part, out);
        }
    }

    fn finish(&mut self) -> Option<ConflictFile> {
        self.current.take().map(PartialConflictFile::build)
    }
}
