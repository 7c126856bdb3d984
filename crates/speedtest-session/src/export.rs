//! Export formats for saved sessions.

use std::{fmt, str::FromStr};

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::record::{STORE_VERSION, SavedRecord};

/// Value of `metadata.source` in JSON exports.
pub const EXPORT_SOURCE: &str = "Clash SpeedTest";

const CSV_HEADERS: [&str; 11] = [
    "ID",
    "Saved At",
    "Config Path",
    "Total Targets",
    "Successful",
    "Failed",
    "Avg Download (Mbps)",
    "Avg Latency (ms)",
    "Best Target",
    "Duration",
    "Notes",
];

/// Export format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ExportFormat {
    /// Full-fidelity document that can be imported again.
    #[default]
    Json,
    /// One summary row per session.
    Csv,
}

impl FromStr for ExportFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "csv" => Ok(Self::Csv),
            other => Err(format!("unknown export format: {other}")),
        }
    }
}

impl fmt::Display for ExportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Json => "json",
            Self::Csv => "csv",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportMetadata {
    pub export_time: DateTime<Utc>,
    pub version: String,
    pub total_sessions: usize,
    pub source: String,
}

/// JSON export document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportDocument {
    pub metadata: ExportMetadata,
    pub sessions: Vec<SavedRecord>,
}

impl ExportDocument {
    #[must_use]
    pub fn new(sessions: Vec<SavedRecord>, export_time: DateTime<Utc>) -> Self {
        Self {
            metadata: ExportMetadata {
                export_time,
                version: STORE_VERSION.to_string(),
                total_sessions: sessions.len(),
                source: EXPORT_SOURCE.to_string(),
            },
            sessions,
        }
    }
}

/// Pretty-printed JSON export.
///
/// # Errors
/// Returns error if serialization fails.
pub fn to_json(
    sessions: Vec<SavedRecord>,
    export_time: DateTime<Utc>,
) -> Result<String, serde_json::Error> {
    serde_json::to_string_pretty(&ExportDocument::new(sessions, export_time))
}

/// Summary table with every cell quoted.
#[must_use]
pub fn to_csv(sessions: &[SavedRecord]) -> String {
    let mut lines = Vec::with_capacity(sessions.len() + 1);
    lines.push(csv_row(CSV_HEADERS.iter().map(|h| (*h).to_string())));

    for record in sessions {
        let done = &record.complete_data;
        let best = if done.best_target.is_empty() {
            "N/A".to_string()
        } else {
            done.best_target.clone()
        };
        lines.push(csv_row([
            record.id.to_string(),
            record.saved_at.to_rfc3339_opts(SecondsFormat::Secs, true),
            record.config_path().to_string(),
            record.start_data.total_targets.to_string(),
            done.successful.to_string(),
            done.failed.to_string(),
            format!("{:.2}", done.avg_download_mbps),
            format!("{:.0}", done.avg_latency),
            best,
            record.meta.duration.clone(),
            record.meta.user_notes.clone().unwrap_or_default(),
        ]));
    }

    lines.join("\n")
}

fn csv_row(cells: impl IntoIterator<Item = String>) -> String {
    cells
        .into_iter()
        .map(|cell| format!("\"{}\"", cell.replace('"', "\"\"")))
        .collect::<Vec<_>>()
        .join(",")
}

/// Records of a JSON export.
///
/// # Errors
/// Returns error if `contents` is not a JSON export document.
pub fn parse(contents: &str) -> Result<Vec<SavedRecord>, serde_json::Error> {
    serde_json::from_str::<ExportDocument>(contents).map(|doc| doc.sessions)
}
