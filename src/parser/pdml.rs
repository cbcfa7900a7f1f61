//! Detail-tree variant: one `<packet>` of nested `<proto>`/`<field>` nodes.
//!
//! Every node may carry `pos`/`size` (its byte span in the packet) and a hex
//! `value`, which together give the byte map used for highlighting.

use tokio::io::AsyncBufRead;

use super::{Element, ElementReader, ParseWarning};
use crate::config::ParsePolicy;
use crate::error::ParseError;
use crate::model::{DetailArtifact, DetailNode, NodeKind};

const RECORD_TAGS: &[&str] = &["packet"];

fn parse_u64(element: &Element, key: &str) -> Result<Option<u64>, String> {
    match element.attr(key) {
        None | Some("") => Ok(None),
        Some(text) => text
            .parse::<u64>()
            .map(Some)
            .map_err(|_| format!("<{}> has bad {} {:?}", element.name, key, text)),
    }
}

fn node_from(element: &Element) -> Result<DetailNode, String> {
    let kind = if element.name == "proto" {
        NodeKind::Proto
    } else {
        NodeKind::Field
    };
    let name = element.attr("name").unwrap_or_default();
    let mut node = DetailNode::new(kind, name);
    node.show_name = element.attr("showname").map(str::to_string);
    node.show = element.attr("show").map(str::to_string);
    node.value = element.attr("value").map(str::to_string);
    node.pos = parse_u64(element, "pos")?;
    node.size = parse_u64(element, "size")?;
    node.hidden = element.attr("hide") == Some("yes");
    node.children = element
        .children
        .iter()
        .map(node_from)
        .collect::<Result<Vec<_>, _>>()?;
    Ok(node)
}

/// Detail trees in stream order.
pub struct DetailStream<R> {
    elements: ElementReader<R>,
    index_base: u64,
    last_index: u64,
}

impl<R: AsyncBufRead + Unpin> DetailStream<R> {
    pub fn new(input: R, policy: ParsePolicy) -> Self {
        Self {
            elements: ElementReader::new(input, RECORD_TAGS, policy),
            index_base: 0,
            last_index: 0,
        }
    }

    /// Add `base` to every packet number the decoder prints
    pub fn with_index_base(mut self, base: u64) -> Self {
        self.index_base = base;
        self
    }

    pub fn take_warnings(&mut self) -> Vec<ParseWarning> {
        self.elements.take_warnings()
    }

    /// Next packet tree, or `None` at end of stream.
    pub async fn next_artifact(&mut self) -> Result<Option<DetailArtifact>, ParseError> {
        while let Some(packet) = self.elements.next_element().await? {
            let protos = match packet
                .children
                .iter()
                .map(node_from)
                .collect::<Result<Vec<_>, _>>()
            {
                Ok(protos) => protos,
                Err(reason) => {
                    self.elements.report_malformed(reason)?;
                    continue;
                }
            };

            let mut artifact = DetailArtifact { index: 0, protos };
            // geninfo.num is the frame number; fall back to stream position
            let number = artifact
                .find("num")
                .and_then(|n| n.show.as_deref())
                .and_then(|s| s.parse::<u64>().ok());
            artifact.index = match number {
                Some(n) => n + self.index_base,
                None => self.last_index + 1,
            };
            self.last_index = artifact.index;
            return Ok(Some(artifact));
        }
        Ok(None)
    }
}
