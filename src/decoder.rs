//! Command lines for the external dissection tools.
//!
//! `tshark` produces the summary (PSML) and detail (PDML) streams and the
//! derived reports, `dumpcap` writes interface captures, `capinfos` describes
//! a capture file. Nothing here runs a process; every builder returns a
//! [`PipelineSpec`] for the process runner.

use std::path::Path;

use crate::config::{CustomColumn, DecoderConfig, PipelineConfig};
use crate::model::{Anchor, LoadRequest, PacketRange, Source};
use crate::process::{CommandSpec, PipelineSpec, StdinFeed};

/// Standard summary columns, as `title, format` pairs for `gui.column.format`
const DEFAULT_COLUMNS: &[(&str, &str)] = &[
    ("No.", "%m"),
    ("Time", "%t"),
    ("Source", "%s"),
    ("Destination", "%d"),
    ("Protocol", "%p"),
    ("Length", "%L"),
    ("Info", "%i"),
];

/// A summary pipeline plus the offset to add to the packet numbers it prints.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SummaryPlan {
    pub spec: PipelineSpec,
    pub index_base: u64,
}

#[derive(Debug, Clone)]
pub struct Decoder {
    config: DecoderConfig,
    stderr_tail_bytes: usize,
}

fn quote(text: &str) -> String {
    format!("\"{}\"", text.replace('\\', "\\\\").replace('"', "\\\""))
}

fn column_format(custom: &[CustomColumn]) -> String {
    let mut parts: Vec<String> = Vec::new();
    for (title, format) in DEFAULT_COLUMNS {
        parts.push(quote(title));
        parts.push(quote(format));
    }
    for column in custom {
        parts.push(quote(&column.title));
        parts.push(quote(&format!("%Cus:{}", column.field)));
    }
    format!("gui.column.format:{}", parts.join(","))
}

/// `a && b`, parenthesising each side; empty sides drop out
fn conjoin(filter: &str, extra: Option<String>) -> String {
    let filter = filter.trim();
    match extra {
        None => filter.to_string(),
        Some(extra) if filter.is_empty() => extra,
        Some(extra) => format!("({}) && ({})", filter, extra),
    }
}

fn range_filter(range: PacketRange) -> String {
    format!("frame.number >= {} && frame.number < {}", range.start, range.end)
}

impl Decoder {
    pub fn new(config: DecoderConfig, pipeline: &PipelineConfig) -> Self {
        Self {
            config,
            stderr_tail_bytes: pipeline.stderr_tail_bytes,
        }
    }

    pub fn config(&self) -> &DecoderConfig {
        &self.config
    }

    fn tshark(&self) -> CommandSpec {
        CommandSpec::new(&self.config.tshark).args(self.config.extra_args.iter())
    }

    /// A tshark command reading `source`, chained behind a producer when the
    /// source is a pipe.
    fn reading(&self, source: &Source, command: CommandSpec) -> PipelineSpec {
        match source {
            Source::Pipe(producer) => PipelineSpec::single(command.arg("-r").arg("-"))
                .after(producer.clone())
                .with_stderr_tail(self.stderr_tail_bytes),
            _ => {
                let path = source.path().map(|p| p.as_os_str().to_owned()).unwrap_or_default();
                PipelineSpec::single(command.arg("-r").arg(path)).with_stderr_tail(self.stderr_tail_bytes)
            }
        }
    }

    fn with_filter(command: CommandSpec, filter: &str) -> CommandSpec {
        if filter.is_empty() {
            command
        } else {
            command.arg("-Y").arg(filter)
        }
    }

    /// Summary rows for `request`.
    ///
    /// A segment anchor feeds the decoder the saved file header plus the
    /// appended records on stdin; the decoder numbers those packets from 1, so
    /// the plan's `index_base` shifts them back into place.
    pub fn summary(&self, request: &LoadRequest) -> SummaryPlan {
        let mut command = self.tshark().arg("-T").arg("psml").arg("-l");
        if !self.config.custom_columns.is_empty() {
            command = command.arg("-o").arg(column_format(&self.config.custom_columns));
        }
        let ranged = request.range.map(range_filter);

        match (&request.anchor, request.source.path()) {
            (
                Anchor::Segment {
                    header,
                    offset,
                    end,
                    first_index,
                },
                Some(path),
            ) => {
                let command = Self::with_filter(command.arg("-r").arg("-"), &conjoin(&request.filter, ranged));
                let spec = PipelineSpec::single(command)
                    .with_stdin(StdinFeed::FileSegment {
                        prefix: header.clone(),
                        path: path.clone(),
                        start: *offset,
                        end: *end,
                    })
                    .with_stderr_tail(self.stderr_tail_bytes);
                SummaryPlan {
                    spec,
                    index_base: first_index.saturating_sub(1),
                }
            }
            (anchor, _) => {
                let after = match anchor {
                    Anchor::After(index) => Some(format!("frame.number > {}", index)),
                    _ => None,
                };
                let extra = match (ranged, after) {
                    (Some(a), Some(b)) => Some(format!("{} && {}", a, b)),
                    (a, b) => a.or(b),
                };
                let command = Self::with_filter(command, &conjoin(&request.filter, extra));
                SummaryPlan {
                    spec: self.reading(&request.source, command),
                    index_base: 0,
                }
            }
        }
    }

    /// Detail trees for the packets of `range` that pass `filter`.
    pub fn detail(&self, source: &Source, filter: &str, range: PacketRange) -> PipelineSpec {
        let command = self.tshark().arg("-T").arg("pdml");
        let command = Self::with_filter(command, &conjoin(filter, Some(range_filter(range))));
        self.reading(source, command)
    }

    /// Conversation table of `kind` (`eth`, `ip`, `tcp`, `udp`, ...).
    pub fn conversations(&self, source: &Source, filter: &str, kind: &str) -> PipelineSpec {
        let mut stat = format!("conv,{}", kind);
        if !filter.trim().is_empty() {
            stat.push(',');
            stat.push_str(filter.trim());
        }
        let command = self.tshark().arg("-q").arg("-z").arg(stat);
        self.reading(source, command)
    }

    /// Capture metadata; `None` for sources without a file
    pub fn capture_info(&self, source: &Source) -> Option<PipelineSpec> {
        let path = source.path()?;
        Some(
            PipelineSpec::single(CommandSpec::new(&self.config.capinfos).arg(path.as_os_str()))
                .with_stderr_tail(self.stderr_tail_bytes),
        )
    }

    /// Long-running capture from `interface` into a legacy pcap file.
    pub fn capture(&self, interface: &str, capture_file: &Path) -> PipelineSpec {
        let command = CommandSpec::new(&self.config.dumpcap)
            .arg("-i")
            .arg(interface)
            .arg("-P")
            .arg("-q")
            .arg("-w")
            .arg(capture_file.as_os_str());
        PipelineSpec::single(command).with_stderr_tail(self.stderr_tail_bytes)
    }
}
