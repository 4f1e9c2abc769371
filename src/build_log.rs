//! Append-only build history: one human-readable line per outcome plus a
//! structured JSON event stream for tooling.

use std::fs::{File, OpenOptions};
use std::io::Write;

use anyhow::{Context, Result};
use camino::Utf8Path;
use serde::Serialize;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

use crate::Pkgbase;
use crate::pkgbuild::PackageVersion;

pub const HUMAN_LOG: &str = "build.log";
pub const JSON_LOG: &str = "build-log.json";

#[derive(Serialize, Debug)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event<'a> {
    BuildStart {
        pkgbase: &'a Pkgbase,
        newver: Option<&'a str>,
    },
    Successful {
        pkgbase: &'a Pkgbase,
        newver: Option<&'a str>,
        version: &'a PackageVersion,
        elapsed_secs: u64,
    },
    Failed {
        pkgbase: &'a Pkgbase,
        newver: Option<&'a str>,
        reason: &'a str,
        elapsed_secs: u64,
    },
    Skipped {
        pkgbase: &'a Pkgbase,
        reason: &'a str,
    },
    BuildEnd {
        pkgbase: &'a Pkgbase,
        elapsed_secs: u64,
    },
}

impl Event<'_> {
    fn human_line(&self) -> String {
        match self {
            Event::BuildStart { pkgbase, newver } => {
                format!("{pkgbase} {} build started", newver.unwrap_or("-"))
            }
            Event::Successful {
                pkgbase,
                version,
                elapsed_secs,
                ..
            } => format!("{pkgbase} {version} successful after {elapsed_secs}s"),
            Event::Failed {
                pkgbase,
                newver,
                reason,
                elapsed_secs,
            } => format!(
                "{pkgbase} {} failed after {elapsed_secs}s: {reason}",
                newver.unwrap_or("-")
            ),
            Event::Skipped { pkgbase, reason } => format!("{pkgbase} skipped: {reason}"),
            Event::BuildEnd {
                pkgbase,
                elapsed_secs,
            } => format!("{pkgbase} build ended after {elapsed_secs}s"),
        }
    }
}

#[derive(Serialize)]
struct Record<'a> {
    ts: String,
    #[serde(flatten)]
    event: &'a Event<'a>,
}

pub struct BuildLog {
    human: File,
    json: File,
}

impl BuildLog {
    /// Opens both logs for appending at the root of the log tree, so the
    /// history spans invocations.
    pub fn open(logdir: &Utf8Path) -> Result<Self> {
        let open = |name: &str| {
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(logdir.join(name))
                .with_context(|| format!("Failed to open {}", logdir.join(name)))
        };
        Ok(BuildLog {
            human: open(HUMAN_LOG)?,
            json: open(JSON_LOG)?,
        })
    }

    /// Best effort: a full log disk must not fail the build it records.
    pub fn record(&mut self, event: &Event<'_>) {
        let ts = OffsetDateTime::now_utc()
            .format(&Rfc3339)
            .unwrap_or_default();

        let record = Record { ts: ts.clone(), event };
        match serde_json::to_string(&record) {
            Ok(line) => {
                if let Err(e) = writeln!(self.json, "{line}") {
                    tracing::error!("Failed to append to {JSON_LOG}: {e:#}");
                }
            }
            Err(e) => tracing::error!("Failed to serialize build event: {e:#}"),
        }

        if let Err(e) = writeln!(self.human, "[{ts}] {}", event.human_line()) {
            tracing::error!("Failed to append to {HUMAN_LOG}: {e:#}");
        }
    }
}
