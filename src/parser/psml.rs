//! Summary-list variant: one `<packet>` of positional `<section>`s per row.
//!
//! ```text
//! <psml>
//!   <structure><section>No.</section><section>Time</section>...</structure>
//!   <packet><section>1</section><section>0.000000</section>...</packet>
//! </psml>
//! ```

use tokio::io::AsyncBufRead;
use tracing::debug;

use super::{Element, ElementReader, ParseWarning};
use crate::config::ParsePolicy;
use crate::error::ParseError;
use crate::model::SummaryRow;

const RECORD_TAGS: &[&str] = &["structure", "packet"];

#[derive(Debug, Clone, PartialEq, Eq)]
enum Column {
    Index,
    Time,
    Source,
    Destination,
    Protocol,
    Length,
    Info,
    Custom(String),
}

impl Column {
    fn from_title(title: &str) -> Self {
        match title.trim() {
            "No." | "Number" => Column::Index,
            "Time" => Column::Time,
            "Source" => Column::Source,
            "Destination" => Column::Destination,
            "Protocol" => Column::Protocol,
            "Length" | "Len" => Column::Length,
            "Info" => Column::Info,
            other => Column::Custom(other.to_string()),
        }
    }
}

fn default_columns() -> Vec<Column> {
    vec![
        Column::Index,
        Column::Time,
        Column::Source,
        Column::Destination,
        Column::Protocol,
        Column::Length,
        Column::Info,
    ]
}

fn non_empty(text: &str) -> Option<String> {
    let text = text.trim();
    (!text.is_empty()).then(|| text.to_string())
}

/// Summary rows in strictly increasing index order.
pub struct SummaryStream<R> {
    elements: ElementReader<R>,
    columns: Vec<Column>,
    index_base: u64,
    last_index: Option<u64>,
}

impl<R: AsyncBufRead + Unpin> SummaryStream<R> {
    pub fn new(input: R, policy: ParsePolicy) -> Self {
        Self {
            elements: ElementReader::new(input, RECORD_TAGS, policy),
            columns: default_columns(),
            index_base: 0,
            last_index: None,
        }
    }

    /// Add `base` to every index the decoder prints.
    ///
    /// Used when the decoder only sees a tail segment of the capture and
    /// numbers its packets from 1.
    pub fn with_index_base(mut self, base: u64) -> Self {
        self.index_base = base;
        self
    }

    /// Column titles beyond the standard ones, in output order
    pub fn custom_columns(&self) -> Vec<&str> {
        self.columns
            .iter()
            .filter_map(|c| match c {
                Column::Custom(title) => Some(title.as_str()),
                _ => None,
            })
            .collect()
    }

    pub fn take_warnings(&mut self) -> Vec<ParseWarning> {
        self.elements.take_warnings()
    }

    /// Next row, or `None` at end of stream.
    pub async fn next_row(&mut self) -> Result<Option<SummaryRow>, ParseError> {
        while let Some(element) = self.elements.next_element().await? {
            if element.name == "structure" {
                self.columns = element
                    .children
                    .iter()
                    .map(|section| Column::from_title(&section.text))
                    .collect();
                debug!("Summary columns: {:?}", self.columns);
                continue;
            }

            let row = match self.row_from(&element) {
                Ok(row) => row,
                Err(reason) => {
                    self.elements.report_malformed(reason)?;
                    continue;
                }
            };
            if let Some(last) = self.last_index {
                if row.index <= last {
                    self.elements.report_malformed(format!(
                        "packet {} does not follow packet {}",
                        row.index, last
                    ))?;
                    continue;
                }
            }
            self.last_index = Some(row.index);
            return Ok(Some(row));
        }
        Ok(None)
    }

    fn row_from(&self, packet: &Element) -> Result<SummaryRow, String> {
        let mut row = SummaryRow::default();
        let mut index = None;

        for (column, section) in self.columns.iter().zip(&packet.children) {
            let text = section.text.as_str();
            match column {
                Column::Index => {
                    index = Some(
                        text.trim()
                            .parse::<u64>()
                            .map_err(|_| format!("bad packet number {:?}", text))?,
                    );
                }
                Column::Time => row.timestamp = non_empty(text),
                Column::Source => row.source = non_empty(text),
                Column::Destination => row.destination = non_empty(text),
                Column::Protocol => row.protocol = non_empty(text),
                Column::Length => {
                    row.length = match text.trim() {
                        "" => None,
                        digits => Some(
                            digits
                                .parse::<u64>()
                                .map_err(|_| format!("bad length {:?}", text))?,
                        ),
                    }
                }
                Column::Info => row.info = non_empty(text),
                Column::Custom(title) => row.custom.push((title.clone(), text.trim().to_string())),
            }
        }

        let index = index.ok_or_else(|| "packet without a number".to_string())?;
        if index == 0 {
            return Err("packet number 0".into());
        }
        row.index = index + self.index_base;
        Ok(row)
    }
}
