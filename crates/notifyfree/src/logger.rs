// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! `tracing` event formatter for the crate's own diagnostics.
//!
//! ```text
//! NOTIFYFREE | LEVEL | [target] [span_name{span_fields}:] message {event_fields}
//! ```
//!
//! The `[target]` tag is only written for events emitted outside this crate,
//! such as HTTP transport warnings, so they can be told apart from delivery
//! diagnostics. Diagnostics go to whatever subscriber the host installs, never
//! back into a [`crate::handler::LogHandler`].

use std::fmt;
use tracing_core::{Event, Subscriber};
use tracing_subscriber::fmt::{
    format::{self, FormatEvent, FormatFields},
    FmtContext, FormattedFields,
};
use tracing_subscriber::registry::LookupSpan;

const CRATE_TARGET: &str = env!("CARGO_CRATE_NAME");
const DEFAULT_PREFIX: &str = "NOTIFYFREE";

#[derive(Debug, Clone, Copy)]
pub struct Formatter {
    prefix: &'static str,
}

impl Default for Formatter {
    fn default() -> Self {
        Formatter {
            prefix: DEFAULT_PREFIX,
        }
    }
}

impl Formatter {
    /// Formatter whose lines start with `prefix` instead of `NOTIFYFREE`.
    pub fn with_prefix(prefix: &'static str) -> Self {
        Formatter { prefix }
    }
}

fn is_foreign(target: &str) -> bool {
    target
        .strip_prefix(CRATE_TARGET)
        .is_none_or(|rest| !(rest.is_empty() || rest.starts_with("::")))
}

impl<S, N> FormatEvent<S, N> for Formatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: format::Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let metadata = event.metadata();
        write!(&mut writer, "{} | {} | ", self.prefix, metadata.level())?;
        if is_foreign(metadata.target()) {
            write!(&mut writer, "[{}] ", metadata.target())?;
        }

        if let Some(scope) = ctx.event_scope() {
            for span in scope.from_root() {
                write!(writer, "{}", span.name())?;

                let ext = span.extensions();
                if let Some(fields) = ext.get::<FormattedFields<N>>() {
                    if !fields.is_empty() {
                        write!(writer, "{{{fields}}}")?;
                    }
                }
                write!(writer, ": ")?;
            }
        }

        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::sync::{Arc, Mutex};
    use tracing::subscriber::with_default;
    use tracing_subscriber::fmt::MakeWriter;

    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl io::Write for Captured {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().expect("lock").extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl<'a> MakeWriter<'a> for Captured {
        type Writer = Captured;

        fn make_writer(&'a self) -> Self::Writer {
            self.clone()
        }
    }

    fn capture(formatter: Formatter, emit: impl FnOnce()) -> String {
        let captured = Captured::default();
        let subscriber = tracing_subscriber::fmt()
            .event_format(formatter)
            .with_writer(captured.clone())
            .finish();
        with_default(subscriber, emit);
        let bytes = captured.0.lock().expect("lock").clone();
        String::from_utf8(bytes).expect("utf8")
    }

    #[test]
    fn test_format_with_span_and_fields() {
        let output = capture(Formatter::default(), || {
            let span = tracing::info_span!("flush", chunks = 2);
            let _guard = span.enter();
            tracing::warn!(failed = 1, "chunk failed");
        });
        assert_eq!(output, "NOTIFYFREE | WARN | flush{chunks=2}: chunk failed failed=1\n");
    }

    #[test]
    fn test_foreign_targets_are_tagged() {
        let output = capture(Formatter::default(), || {
            tracing::warn!(target: "reqwest::connect", "connection reset");
            tracing::info!(target: "notifyfree::client", "batch sent");
            tracing::info!(target: "notifyfree_cli", "done");
        });
        let lines: Vec<&str> = output.lines().collect();
        assert_eq!(
            lines,
            vec![
                "NOTIFYFREE | WARN | [reqwest::connect] connection reset",
                "NOTIFYFREE | INFO | batch sent",
                "NOTIFYFREE | INFO | [notifyfree_cli] done",
            ]
        );
    }

    #[test]
    fn test_custom_prefix() {
        let output = capture(Formatter::with_prefix("BILLING"), || {
            tracing::error!("delivery failed");
        });
        assert_eq!(output, "BILLING | ERROR | delivery failed\n");
    }
}
