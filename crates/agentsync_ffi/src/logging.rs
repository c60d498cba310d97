//! Forwarding `tracing` events to the host's logger.

use crate::types::{AspLogLevel, AspLogger};
use std::ffi::CString;
use std::fmt::{self, Write as _};
use tracing::field::{Field, Visit};
use tracing::{Dispatch, Event, Subscriber};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::{Context, Layer, SubscriberExt};

/// Layer handing each event to a C logger as one line of text.
pub(crate) struct CallbackLayer {
    logger: AspLogger,
}

impl<S: Subscriber> Layer<S> for CallbackLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut line = LineVisitor::default();
        event.record(&mut line);

        // interior NULs would truncate the line on the C side
        let text = line.finish().replace('\0', " ");
        if let Ok(text) = CString::new(text) {
            (self.logger)(AspLogLevel::from(event.metadata().level()), text.as_ptr());
        }
    }
}

/// Renders `message key=value key=value`.
#[derive(Default)]
struct LineVisitor {
    message: String,
    fields: String,
}

impl LineVisitor {
    fn finish(self) -> String {
        if self.fields.is_empty() {
            self.message
        } else if self.message.is_empty() {
            self.fields
        } else {
            format!("{} {}", self.message, self.fields)
        }
    }
}

impl Visit for LineVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message.push_str(value);
        } else {
            self.record_debug(field, &value);
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            let _ = write!(self.message, "{value:?}");
            return;
        }
        if !self.fields.is_empty() {
            self.fields.push(' ');
        }
        let _ = write!(self.fields, "{}={:?}", field.name(), value);
    }
}

/// Builds the dispatcher a handle runs its calls under.
///
/// Without a logger every event is discarded.
pub(crate) fn dispatch_for(logger: Option<AspLogger>) -> Dispatch {
    match logger {
        Some(logger) => Dispatch::new(
            tracing_subscriber::registry()
                .with(CallbackLayer { logger })
                .with(LevelFilter::DEBUG),
        ),
        None => Dispatch::none(),
    }
}
