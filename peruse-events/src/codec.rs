//! Repository frame decoding.
//!
//! The binary repository codec lives outside this crate; the consumer only
//! talks to a [`RepoDecoder`]. [`JsonFrameCodec`] handles JSON-encoded frames
//! whose blocks are an inline map of record path to base64 record bytes.

use std::collections::HashMap;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use peruse_core::{Cid, CommitEvent, OpAction, RecordOp, StreamError};
use serde::{Deserialize, Serialize};

/// One decoded frame from the relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Commit(CommitEvent),
    /// Identity, account, info and other frames the consumer does not act on.
    Other { kind: String },
}

/// A record block as carried in a commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    /// Content identifier computed from the block bytes.
    pub cid: Cid,
    pub bytes: Vec<u8>,
}

/// Record blocks of one commit, keyed by repo path.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockSet {
    blocks: HashMap<String, Block>,
}

impl BlockSet {
    pub fn insert(&mut self, path: impl Into<String>, block: Block) {
        self.blocks.insert(path.into(), block);
    }

    pub fn get(&self, path: &str) -> Option<&Block> {
        self.blocks.get(path)
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}

/// Decodes relay frames, commit block sets and record payloads.
pub trait RepoDecoder: Send + Sync {
    fn decode_frame(&self, bytes: &[u8]) -> Result<Frame, StreamError>;

    /// Decode the blocks carried by `event`, computing each block's cid.
    fn decode_blocks(&self, event: &CommitEvent) -> Result<BlockSet, StreamError>;

    /// Decode a record block into JSON.
    fn decode_record(&self, path: &str, block: &Block) -> Result<serde_json::Value, StreamError>;
}

// ============================================================================
// JSON FRAMES
// ============================================================================

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireOp {
    action: OpAction,
    path: String,
    #[serde(default)]
    cid: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireCommit {
    seq: i64,
    repo: String,
    #[serde(default)]
    rev: String,
    #[serde(default)]
    time: String,
    #[serde(default)]
    too_big: bool,
    #[serde(default)]
    ops: Vec<WireOp>,
    /// Record path to base64-encoded record bytes.
    #[serde(default)]
    blocks: HashMap<String, String>,
}

/// JSON frame codec.
///
/// A frame looks like
/// `{"t":"#commit","seq":1,"repo":"did:plc:..","time":"..","ops":[..],"blocks":{"<path>":"<base64>"}}`.
/// Block cids are `sha256:<hex>` of the record bytes.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonFrameCodec;

impl JsonFrameCodec {
    pub fn new() -> Self {
        Self
    }

    /// Encode a commit frame. Used to build fixtures and by tools replaying captured streams.
    pub fn encode_commit(
        seq: i64,
        repo: &str,
        time: &str,
        too_big: bool,
        ops: &[(OpAction, &str, Option<&Cid>)],
        records: &[(&str, &[u8])],
    ) -> Vec<u8> {
        let ops: Vec<WireOp> = ops
            .iter()
            .map(|(action, path, cid)| WireOp {
                action: *action,
                path: path.to_string(),
                cid: cid.map(|c| c.to_string()),
            })
            .collect();
        let blocks: HashMap<&str, String> = records
            .iter()
            .map(|(path, bytes)| (*path, STANDARD.encode(bytes)))
            .collect();
        let frame = serde_json::json!({
            "t": "#commit",
            "seq": seq,
            "repo": repo,
            "rev": "",
            "time": time,
            "tooBig": too_big,
            "ops": ops,
            "blocks": blocks,
        });
        frame.to_string().into_bytes()
    }
}

impl RepoDecoder for JsonFrameCodec {
    fn decode_frame(&self, bytes: &[u8]) -> Result<Frame, StreamError> {
        let value: serde_json::Value =
            serde_json::from_slice(bytes).map_err(|e| StreamError::FrameDecode {
                reason: e.to_string(),
            })?;
        let kind = value
            .get("t")
            .and_then(|t| t.as_str())
            .ok_or_else(|| StreamError::FrameDecode {
                reason: "frame has no type".to_string(),
            })?
            .to_string();
        if kind != "#commit" {
            return Ok(Frame::Other { kind });
        }

        let wire: WireCommit =
            serde_json::from_value(value).map_err(|e| StreamError::FrameDecode {
                reason: e.to_string(),
            })?;
        let blocks = serde_json::to_vec(&wire.blocks).map_err(|e| StreamError::FrameDecode {
            reason: e.to_string(),
        })?;
        Ok(Frame::Commit(CommitEvent {
            repo: wire.repo,
            seq: wire.seq,
            rev: wire.rev,
            time: wire.time,
            too_big: wire.too_big,
            ops: wire
                .ops
                .into_iter()
                .map(|op| RecordOp {
                    action: op.action,
                    path: op.path,
                    cid: op.cid.map(Cid::new),
                })
                .collect(),
            blocks,
        }))
    }

    fn decode_blocks(&self, event: &CommitEvent) -> Result<BlockSet, StreamError> {
        let block_err = |reason: String| StreamError::BlockDecode {
            repo: event.repo.clone(),
            reason,
        };
        if event.blocks.is_empty() {
            return Ok(BlockSet::default());
        }

        let encoded: HashMap<String, String> =
            serde_json::from_slice(&event.blocks).map_err(|e| block_err(e.to_string()))?;
        let mut set = BlockSet::default();
        for (path, data) in encoded {
            let bytes = STANDARD
                .decode(data.as_bytes())
                .map_err(|e| block_err(format!("{path}: {e}")))?;
            set.insert(
                path,
                Block {
                    cid: Cid::for_bytes(&bytes),
                    bytes,
                },
            );
        }
        Ok(set)
    }

    fn decode_record(&self, path: &str, block: &Block) -> Result<serde_json::Value, StreamError> {
        serde_json::from_slice(&block.bytes).map_err(|e| StreamError::RecordDecode {
            path: path.to_string(),
            reason: e.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PATH: &str = "app.bsky.feed.post/3kq2sneqbkm2a";

    #[test]
    fn test_decode_commit_frame() {
        let record = br#"{"text":"hi","createdAt":"2024-05-31T10:00:00Z"}"#;
        let cid = Cid::for_bytes(record);
        let bytes = JsonFrameCodec::encode_commit(
            42,
            "did:plc:abc",
            "2024-05-31T10:00:01Z",
            false,
            &[(OpAction::Create, PATH, Some(&cid))],
            &[(PATH, &record[..])],
        );

        let codec = JsonFrameCodec::new();
        let Frame::Commit(event) = codec.decode_frame(&bytes).unwrap() else {
            panic!("expected a commit frame");
        };
        assert_eq!(event.seq, 42);
        assert_eq!(event.ops[0].cid.as_ref(), Some(&cid));

        let blocks = codec.decode_blocks(&event).unwrap();
        let block = blocks.get(PATH).unwrap();
        assert_eq!(block.cid, cid);
        let payload = codec.decode_record(PATH, block).unwrap();
        assert_eq!(payload["text"], "hi");
    }

    #[test]
    fn test_non_commit_frames_are_passed_through() {
        let codec = JsonFrameCodec::new();
        let frame = codec
            .decode_frame(br##"{"t":"#identity","did":"did:plc:abc"}"##)
            .unwrap();
        assert_eq!(
            frame,
            Frame::Other {
                kind: "#identity".to_string()
            }
        );
    }

    #[test]
    fn test_malformed_frames_are_errors() {
        let codec = JsonFrameCodec::new();
        assert!(matches!(
            codec.decode_frame(b"\x00\x01"),
            Err(StreamError::FrameDecode { .. })
        ));
        assert!(codec.decode_frame(br#"{"seq":1}"#).is_err());
    }

    #[test]
    fn test_bad_base64_block_is_an_error() {
        let codec = JsonFrameCodec::new();
        let event = CommitEvent {
            repo: "did:plc:abc".to_string(),
            seq: 1,
            rev: String::new(),
            time: String::new(),
            too_big: false,
            ops: Vec::new(),
            blocks: br#"{"app.bsky.feed.post/x":"***"}"#.to_vec(),
        };
        assert!(matches!(
            codec.decode_blocks(&event),
            Err(StreamError::BlockDecode { .. })
        ));
    }
}
