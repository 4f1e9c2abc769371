//! Failure reporting towards maintainers and the repository admin.

use std::collections::HashMap;
use std::io::Write;
use std::process::{Command, Stdio};
use std::sync::LazyLock;

use regex::Regex;

use crate::Pkgbase;
use crate::recipe::Recipe;

/// Delivery sink for reports. Sending never fails the cycle; transport
/// problems are logged and swallowed by the implementation.
pub trait Reporter {
    fn send(&self, recipients: &[String], subject: &str, body: &str);
}

pub fn report_to_maintainers(
    reporter: &dyn Reporter,
    recipe: &Recipe,
    subject: &str,
    body: &str,
) {
    let recipients: Vec<String> = recipe
        .maintainers
        .iter()
        .map(|maintainer| maintainer.address())
        .collect();
    reporter.send(&recipients, subject, body);
}

/// For reports that have no maintainer to go to: recipe load failures and
/// runtime errors of the orchestrator itself.
pub fn report_admin(reporter: &dyn Reporter, admin: Option<&str>, subject: &str, body: &str) {
    match admin {
        Some(admin) => reporter.send(&[admin.to_string()], subject, body),
        None => tracing::warn!("No admin recipient configured, dropping report {subject:?}"),
    }
}

/// Pipes an RFC-822 style message into a sendmail-compatible command.
pub struct Sendmail {
    pub command: Vec<String>,
    pub from: String,
}

impl Reporter for Sendmail {
    fn send(&self, recipients: &[String], subject: &str, body: &str) {
        if recipients.is_empty() {
            tracing::warn!("No recipients for report {subject:?}, dropping it");
            return;
        }
        tracing::info!("Sending report {subject:?} to {recipients:?}");
        if let Err(e) = self.pipe_message(recipients, subject, body) {
            tracing::error!("Failed to send report {subject:?}: {e:#}");
        }
    }
}

impl Sendmail {
    fn pipe_message(
        &self,
        recipients: &[String],
        subject: &str,
        body: &str,
    ) -> anyhow::Result<()> {
        let (program, args) = self
            .command
            .split_first()
            .ok_or_else(|| anyhow::anyhow!("empty mail command"))?;
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .spawn()?;

        let message = format!(
            "From: {}\nTo: {}\nSubject: {}\n\n{}\n",
            self.from,
            recipients.join(", "),
            subject,
            body,
        );
        child
            .stdin
            .take()
            .expect("stdin was piped")
            .write_all(message.as_bytes())?;

        let status = child.wait()?;
        if !status.success() {
            anyhow::bail!("mail command exited with {status}");
        }
        Ok(())
    }
}

static IDENTIFIER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[A-Za-z0-9._+-]+").unwrap());

/// Append `  (@handle ...)` to lines whose first identifier-shaped token
/// names a managed package; other lines pass through unchanged.
pub fn annotate_line(line: &str, maintainers: &HashMap<Pkgbase, Vec<String>>) -> String {
    let Some(token) = IDENTIFIER.find(line) else {
        return line.to_string();
    };
    let Some(handles) = maintainers.get(&Pkgbase::from(token.as_str())) else {
        return line.to_string();
    };
    let mentions: Vec<String> = handles.iter().map(|handle| format!("@{handle}")).collect();
    format!("{line}  ({})", mentions.join(" "))
}

pub fn maintainer_handles(recipes: &HashMap<Pkgbase, Recipe>) -> HashMap<Pkgbase, Vec<String>> {
    recipes
        .iter()
        .map(|(pkgbase, recipe)| {
            let handles = recipe
                .maintainers
                .iter()
                .map(|maintainer| maintainer.handle.clone())
                .collect();
            (pkgbase.clone(), handles)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::*;

    fn handles() -> HashMap<Pkgbase, Vec<String>> {
        [
            (
                Pkgbase::from("python-foo"),
                vec!["jane".to_string(), "joe".to_string()],
            ),
            (Pkgbase::from("bar"), vec!["jane".to_string()]),
        ]
        .into()
    }

    #[rstest]
    #[case("python-foo 1.0-1 -> 1.1-1", "python-foo 1.0-1 -> 1.1-1  (@jane @joe)")]
    #[case("bar: build failed", "bar: build failed  (@jane)")]
    #[case("unknown-pkg 1.0", "unknown-pkg 1.0")]
    #[case("*** no identifier here: !!!", "*** no identifier here: !!!")]
    #[case("", "")]
    fn annotation(#[case] input: &str, #[case] expected: &str) {
        assert_eq!(annotate_line(input, &handles()), expected);
    }
}
