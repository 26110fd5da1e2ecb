use super::{Assembler, StitchError};
use crate::stitch::blobs::octal_mode;
use bytes::{Bytes, BytesMut};
use std::collections::VecDeque;

/// One `CommitDiff` message. Metadata is only meaningful on the first
/// message of each diff, the patch continues until `end_of_patch`.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CommitDiffResponse {
    pub from_path: Vec<u8>,
    pub to_path: Vec<u8>,
    pub from_id: String,
    pub to_id: String,
    pub old_mode: i32,
    pub new_mode: i32,
    pub binary: bool,
    pub raw_patch_data: Bytes,
    pub end_of_patch: bool,
    /// Marks that the server stopped sending diffs because of size limits
    pub overflow_marker: bool,
    pub collapsed: bool,
    pub too_large: bool,
    pub lines_added: i32,
    pub lines_removed: i32,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Diff {
    pub from_path: String,
    pub to_path: String,
    pub from_id: String,
    pub to_id: String,
    pub old_mode: Option<String>,
    pub new_mode: Option<String>,
    pub binary: bool,
    pub patch: Bytes,
    pub overflow_marker: bool,
    pub collapsed: bool,
    pub too_large: bool,
    pub lines_added: i32,
    pub lines_removed: i32,
}

#[derive(Debug)]
struct PartialDiff {
    diff: Diff,
    patch: BytesMut,
}

impl PartialDiff {
    fn start(message: CommitDiffResponse) -> Self {
        PartialDiff {
            patch: BytesMut::from(&message.raw_patch_data[..]),
            diff: Diff {
                from_path: String::from_utf8_lossy(&message.from_path).into_owned(),
                to_path: String::from_utf8_lossy(&message.to_path).into_owned(),
                from_id: message.from_id,
                to_id: message.to_id,
                old_mode: octal_mode(message.old_mode),
                new_mode: octal_mode(message.new_mode),
                binary: message.binary,
                patch: Bytes::new(),
                overflow_marker: message.overflow_marker,
                collapsed: message.collapsed,
                too_large: message.too_large,
                lines_added: message.lines_added,
                lines_removed: message.lines_removed,
            },
        }
    }

    fn build(self) -> Diff {
        Diff {
            patch: self.patch.freeze(),
            ..self.diff
        }
    }
}

#[derive(Debug, Default)]
pub struct DiffAssembler {
    current: Option<PartialDiff>,
}

impl DiffAssembler {
    pub fn new() -> Self {
        DiffAssembler::default()
    }
}

impl Assembler for DiffAssembler {
    type Message = CommitDiffResponse;
    type Output = Diff;

    fn push(&mut self, message: CommitDiffResponse, out: &mut VecDeque<Result<Diff, StitchError>>) {
        let end_of_patch = message.end_of_patch;

        match self.current.as_mut() {
            Some(partial) => partial.patch.extend_from_slice(&message.raw_patch_data),
            None if message == CommitDiffResponse::default() => return,
            None => self.current = Some(PartialDiff::start(message)),
        }

        let overflow = self
            .current
            .as_ref()
            .is_some_and(|partial| partial.diff.overflow_marker);

        if end_of_patch || overflow {
            if let Some(done) = self.current.take() {
                out.push_back(Ok(done.build()));
            }
        }
    }

    fn finish(&mut self) -> Option<Diff> {
        self.current.take().map(PartialDiff::build)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stitch::test_helpers::collect;

    fn start(path: &str, patch: &'static [u8], end_of_patch: bool) -> CommitDiffResponse {
        CommitDiffResponse {
            from_path: path.as_bytes().to_vec(),
            to_path: path.as_bytes().to_vec(),
            from_id: "1111".into(),
            to_id: "2222".into(),
            old_mode: 0o100644,
            new_mode: 0o100755,
            raw_patch_data: Bytes::from_static(patch),
            end_of_patch,
            lines_added: 3,
            ..CommitDiffResponse::default()
        }
    }

    fn more(patch: &'static [u8], end_of_patch: bool) -> CommitDiffResponse {
        CommitDiffResponse {
            raw_patch_data: Bytes::from_static(patch),
            end_of_patch,
            ..CommitDiffResponse::default()
        }
    }

    #[tokio::test]
    async fn test_stitches_patches() {
        let diffs = collect(
            DiffAssembler::new(),
            vec![
                start("a.rb", b"@@ -1 +1 @@\n", false),
                more(b"-old\n", false),
                more(b"+new\n", true),
                start("b.rb", b"@@ -0,0 +1 @@\n+x\n", true),
            ],
        )
        .await;

        let diffs: Vec<Diff> = diffs.into_iter().map(Result::unwrap).collect();
        assert_eq!(diffs.len(), 2);
        assert_eq!(diffs[0].from_path, "a.rb");
        assert_eq!(diffs[0].patch, Bytes::from_static(b"@@ -1 +1 @@\n-old\n+new\n"));
        assert_eq!(diffs[0].old_mode.as_deref(), Some("100644"));
        assert_eq!(diffs[0].new_mode.as_deref(), Some("100755"));
        assert_eq!(diffs[0].lines_added, 3);
        assert_eq!(diffs[1].to_path, "b.rb");
        assert_eq!(diffs[1].patch, Bytes::from_static(b"@@ -0,0 +1 @@\n+x\n"));
    }

    #[tokio::test]
    async fn test_metadata_comes_from_first_message() {
        let mut continuation = start("other.rb", b"tail", true);
        continuation.from_id = "ffff".into();

        let diffs = collect(
            DiffAssembler::new(),
            vec![start("a.rb", b"head ", false), continuation],
        )
        .await;

        let diff = diffs[0].as_ref().unwrap();
        assert_eq!(diff.from_path, "a.rb");
        assert_eq!(diff.from_id, "1111");
        assert_eq!(diff.patch, Bytes::from_static(b"head tail"));
    }

    #[tokio::test]
    async fn test_unterminated_diff_is_flushed() {
        let diffs = collect(
            DiffAssembler::new(),
            vec![start("a.rb", b"one", true), start("b.rb", b"two", false)],
        )
        .await;

        assert_eq!(diffs.len(), 2);
        assert_eq!(diffs[1].as_ref().unwrap().patch, Bytes::from_static(b"two"));
    }

    #[tokio::test]
    async fn test_overflow_marker_and_empty_messages() {
        let diffs = collect(
            DiffAssembler::new(),
            vec![
                CommitDiffResponse::default(),
                start("a.rb", b"x", true),
                CommitDiffResponse {
                    overflow_marker: true,
                    ..CommitDiffResponse::default()
                },
            ],
        )
        .await;

        assert_eq!(diffs.len(), 2);
        assert!(!diffs[0].as_ref().unwrap().overflow_marker);
        assert!(diffs[1].as_ref().unwrap().overflow_marker);
    }

    #[tokio::test]
    async fn test_empty_patch_with_terminal_flag() {
        let diffs = collect(
            DiffAssembler::new(),
            vec![CommitDiffResponse {
                from_path: b"binary.png".to_vec(),
                to_path: b"binary.png".to_vec(),
                binary: true,
                end_of_patch: true,
                ..CommitDiffResponse::default()
            }],
        )
        .await;

        let diff = diffs[0].as_ref().unwrap();
        assert!(diff.binary);
        assert!(diff.patch.is_empty());
    }
}
