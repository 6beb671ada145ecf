use tracing::span::Entered;
use tracing::{info_span, Span};

/// Per-unit logging context.
///
/// Built once per concurrent unit and handed to each component so log lines
/// from parallel workers stay attributable to their host.
#[derive(Debug, Clone)]
pub struct LogContext {
    span: Span,
}

impl LogContext {
    pub fn controller() -> Self {
        Self {
            span: info_span!("controller"),
        }
    }

    pub fn worker(host: &str) -> Self {
        Self {
            span: info_span!("worker", host = %host),
        }
    }

    pub fn enter(&self) -> Entered<'_> {
        self.span.enter()
    }
}
