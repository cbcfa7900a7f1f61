// src/model.rs
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::process::CommandSpec;

/// Monotonic id of one load attempt.
pub type Generation = u64;

/// Half-open range of 1-based packet indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PacketRange {
    pub start: u64,
    pub end: u64,
}

impl PacketRange {
    pub fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    /// The range covering exactly one packet
    pub fn single(index: u64) -> Self {
        Self::new(index, index + 1)
    }

    /// A chunk of `len` packets aligned to a multiple of `len`, containing `index`
    pub fn chunk_around(index: u64, len: u64) -> Self {
        let len = len.max(1);
        let start = ((index.saturating_sub(1)) / len) * len + 1;
        Self::new(start, start + len)
    }

    pub fn contains(&self, index: u64) -> bool {
        index >= self.start && index < self.end
    }

    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Where packets come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Source {
    /// A finished capture file
    File(PathBuf),
    /// A capture file that is still being written
    Live(PathBuf),
    /// Capture from an interface into `capture_file`, which is then tailed
    Interface {
        interface: String,
        capture_file: PathBuf,
    },
    /// A producer command whose stdout is a capture
    Pipe(CommandSpec),
}

impl Source {
    /// The file on disk backing this source, if any
    pub fn path(&self) -> Option<&PathBuf> {
        match self {
            Source::File(path) | Source::Live(path) => Some(path),
            Source::Interface { capture_file, .. } => Some(capture_file),
            Source::Pipe(_) => None,
        }
    }

    /// Whether the file behind this source keeps growing
    pub fn is_live(&self) -> bool {
        matches!(self, Source::Live(_) | Source::Interface { .. })
    }
}

/// Where in the source a load starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Anchor {
    /// Read everything
    Start,
    /// Feed only `[offset, end)` of a legacy pcap file, behind its file header.
    /// Rows are renumbered so the first packet of the segment is `first_index`.
    Segment {
        header: Vec<u8>,
        offset: u64,
        end: u64,
        first_index: u64,
    },
    /// Read everything, but only emit packets after `index`
    After(u64),
}

/// One load attempt, immutable once issued.
#[derive(Debug, Clone)]
pub struct LoadRequest {
    pub source: Source,
    pub filter: String,
    pub range: Option<PacketRange>,
    pub anchor: Anchor,
    pub generation: Generation,
}

/// One row of the packet list.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SummaryRow {
    /// 1-based frame number
    pub index: u64,
    pub timestamp: Option<String>,
    pub source: Option<String>,
    pub destination: Option<String>,
    pub protocol: Option<String>,
    pub length: Option<u64>,
    pub info: Option<String>,
    /// Columns beyond the standard seven, as (title, value)
    pub custom: Vec<(String, String)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeKind {
    Proto,
    Field,
}

/// One `proto` or `field` node of a detail tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetailNode {
    pub kind: NodeKind,
    pub name: String,
    pub show_name: Option<String>,
    pub show: Option<String>,
    /// Hex-encoded bytes of this node
    pub value: Option<String>,
    pub pos: Option<u64>,
    pub size: Option<u64>,
    pub hidden: bool,
    pub children: Vec<DetailNode>,
}

impl DetailNode {
    pub fn new(kind: NodeKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
            show_name: None,
            show: None,
            value: None,
            pos: None,
            size: None,
            hidden: false,
            children: Vec::new(),
        }
    }

    /// Text to display for this node
    pub fn label(&self) -> &str {
        self.show_name
            .as_deref()
            .or(self.show.as_deref())
            .unwrap_or(&self.name)
    }

    /// Byte span `[pos, pos + size)` when both are known and the end fits
    pub fn span(&self) -> Option<(u64, u64)> {
        let (pos, size) = (self.pos?, self.size?);
        pos.checked_add(size).map(|end| (pos, end))
    }

    fn covers(&self, offset: u64) -> bool {
        self.span()
            .map(|(start, end)| offset >= start && offset < end)
            .unwrap_or(false)
    }

    fn estimated_size(&self) -> usize {
        std::mem::size_of::<Self>()
            + self.name.len()
            + self.show_name.as_ref().map_or(0, String::len)
            + self.show.as_ref().map_or(0, String::len)
            + self.value.as_ref().map_or(0, String::len)
            + self.children.iter().map(Self::estimated_size).sum::<usize>()
    }
}

/// A byte range of the packet claimed by one node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ByteSpan {
    pub depth: usize,
    pub name: String,
    pub pos: u64,
    pub size: u64,
}

/// Largest frame `raw_bytes` will rebuild (the capture tools' maximum snap length)
pub const MAX_FRAME_LEN: u64 = 262_144;

/// The fully parsed detail tree of one packet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetailArtifact {
    pub index: u64,
    pub protos: Vec<DetailNode>,
}

impl DetailArtifact {
    /// Rough heap footprint, used for the cache byte budget
    pub fn estimated_size(&self) -> usize {
        std::mem::size_of::<Self>() + self.protos.iter().map(DetailNode::estimated_size).sum::<usize>()
    }

    /// First node named `name`, depth first
    pub fn find(&self, name: &str) -> Option<&DetailNode> {
        fn walk<'a>(nodes: &'a [DetailNode], name: &str) -> Option<&'a DetailNode> {
            for node in nodes {
                if node.name == name {
                    return Some(node);
                }
                if let Some(found) = walk(&node.children, name) {
                    return Some(found);
                }
            }
            None
        }
        walk(&self.protos, name)
    }

    /// Captured length of the frame, from `geninfo`'s `len` or `frame.len`
    pub fn frame_len(&self) -> Option<u64> {
        let geninfo_len = self
            .protos
            .iter()
            .find(|proto| proto.name == "geninfo")
            .and_then(|geninfo| geninfo.children.iter().find(|field| field.name == "len"));
        let node = geninfo_len.or_else(|| self.find("frame.len"))?;
        node.show.as_deref()?.trim().parse().ok()
    }

    /// Every node with a known position, in document order
    pub fn byte_ranges(&self) -> Vec<ByteSpan> {
        fn walk(nodes: &[DetailNode], depth: usize, out: &mut Vec<ByteSpan>) {
            for node in nodes {
                if let (Some(pos), Some(size)) = (node.pos, node.size) {
                    out.push(ByteSpan {
                        depth,
                        name: node.name.clone(),
                        pos,
                        size,
                    });
                }
                walk(&node.children, depth + 1, out);
            }
        }
        let mut out = Vec::new();
        walk(&self.protos, 0, &mut out);
        out
    }

    /// Path of nodes from a top-level proto down to the deepest node covering `offset`
    pub fn nodes_at(&self, offset: u64) -> Vec<&DetailNode> {
        let mut path = Vec::new();
        let mut level: &[DetailNode] = &self.protos;
        // geninfo and frame span the whole packet; prefer the most specific proto
        while let Some(node) = level
            .iter()
            .rev()
            .find(|n| n.covers(offset) && !n.hidden)
        {
            path.push(node);
            level = &node.children;
        }
        path
    }

    /// Packet bytes rebuilt from each node's hex value at its position.
    ///
    /// Bytes no node accounts for are zero. Spans reaching past the frame
    /// length (or [`MAX_FRAME_LEN`] when it is unknown) are skipped.
    pub fn raw_bytes(&self) -> Vec<u8> {
        fn walk(nodes: &[DetailNode], limit: u64, buf: &mut Vec<u8>) {
            for node in nodes {
                if let (Some((start, end)), Some(value)) = (node.span(), node.value.as_deref()) {
                    if end <= limit {
                        if let Ok(bytes) = hex::decode(value) {
                            if bytes.len() as u64 == end - start {
                                let (start, end) = (start as usize, end as usize);
                                if buf.len() < end {
                                    buf.resize(end, 0);
                                }
                                buf[start..end].copy_from_slice(&bytes);
                            }
                        }
                    }
                }
                walk(&node.children, limit, buf);
            }
        }
        let limit = self.frame_len().map_or(MAX_FRAME_LEN, |len| len.min(MAX_FRAME_LEN));
        let mut buf = Vec::new();
        walk(&self.protos, limit, &mut buf);
        buf
    }
}
