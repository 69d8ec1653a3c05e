// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Diagnostic log formatting for the agent.
//!
//! Agent logs are a side channel: they never influence delivery. Lines look like
//!
//! ```text
//! OTT_AGENT | WARN | QUEUE | Evicting event_20240101_120000_1234.json.gz to stay under budget
//! OTT_AGENT | DEBUG | flush{items=3}: WIRE | delivered status=202
//! ```

use std::fmt;

use tracing_core::{Event, Subscriber};
use tracing_subscriber::fmt::{
    format::{self, FormatEvent, FormatFields},
    FmtContext, FormattedFields,
};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::EnvFilter;

use crate::config::log_level::LogLevel;

/// Log formatter that prefixes every line with `OTT_AGENT` so agent output can be told apart
/// from the host application's own logs.
#[derive(Debug, Clone, Copy)]
pub struct Formatter;

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
        write!(&mut writer, "OTT_AGENT | {} | ", metadata.level())?;

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

/// Installs a global subscriber using [`Formatter`].
///
/// Returns `false` when a global subscriber was already set, in which case the existing one
/// keeps receiving the agent's logs.
pub fn init(log_level: LogLevel) -> bool {
    let filter = EnvFilter::builder()
        .with_default_directive(log_level.as_level_filter().into())
        .parse_lossy("");

    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(filter)
        .event_format(Formatter)
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber).is_ok()
}
