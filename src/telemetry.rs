//! Structured telemetry for protocol anomalies.
//!
//! Anything surprising the client sees on the wire (a message tag it cannot
//! decode, a handshake reply it does not understand, a reliable send that
//! needs many retransmissions) is reported as a [`Violation`] rather
//! than a bare log line. Violations are:
//!
//! - logged via tracing by default ([`TracingObserver`]),
//! - collected programmatically in tests ([`CollectingObserver`]),
//! - forwarded to any custom [`ViolationObserver`] installed on a session.
//!
//! # Example
//!
//! ```
//! use netchan_client::telemetry::{CollectingObserver, ViolationKind};
//! use std::sync::Arc;
//!
//! let observer = Arc::new(CollectingObserver::new());
//! assert!(observer.violations().is_empty());
//! assert!(!observer.has_violation(ViolationKind::Handshake));
//! ```

use crate::network::sequence::SequenceNumber;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Serializes `Option<SequenceNumber>` as its bare counter or `null`.
mod sequence_serializer {
    use crate::network::sequence::SequenceNumber;
    use serde::Serializer;

    #[allow(clippy::ref_option)]
    pub fn serialize<S>(seq: &Option<SequenceNumber>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match seq {
            None => serializer.serialize_none(),
            Some(s) => serializer.serialize_u32(s.value()),
        }
    }
}

/// Severity of a violation, ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationSeverity {
    /// Unexpected but recoverable; the client carried on.
    Warning,
    /// Behavior degraded, e.g. part of a datagram was dropped.
    Error,
    /// The session cannot continue meaningfully.
    Critical,
}

impl ViolationSeverity {
    /// Label for logs and metrics.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Critical => "critical",
        }
    }
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Subsystem a violation belongs to.
///
/// New categories may be added; always include a wildcard arm when matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum ViolationKind {
    /// Wire-level anomaly.
    ///
    /// Examples:
    /// - Message tag without a decoder
    /// - Message layout running past the end of the datagram
    NetworkProtocol,
    /// Reliable delivery anomaly.
    ///
    /// Examples:
    /// - Reliable send needing an unusual number of retransmissions
    /// - Receive backlog overflowing
    Reliability,
    /// Connection handshake anomaly.
    ///
    /// Examples:
    /// - Unrecognised connectionless reply
    /// - Server rejecting the connection
    Handshake,
    /// Configuration constraint violated at runtime.
    Configuration,
    /// Internal logic error; indicates a bug in this crate.
    InternalError,
}

impl ViolationKind {
    /// Label for logs and metrics.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::NetworkProtocol => "network_protocol",
            Self::Reliability => "reliability",
            Self::Handshake => "handshake",
            Self::Configuration => "configuration",
            Self::InternalError => "internal_error",
        }
    }
}

impl std::fmt::Display for ViolationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A recorded protocol anomaly with its diagnostic context.
///
/// # Example
///
/// ```
/// use netchan_client::telemetry::{Violation, ViolationKind, ViolationSeverity};
/// use netchan_client::SequenceNumber;
///
/// let violation = Violation::new(
///     ViolationSeverity::Warning,
///     ViolationKind::NetworkProtocol,
///     "no decoder for tag 3",
///     "frame.rs:42",
/// )
/// .with_sequence(SequenceNumber::new(100, false))
/// .with_context("offset", "12");
///
/// assert_eq!(violation.sequence.map(|s| s.value()), Some(100));
/// assert_eq!(violation.context["offset"], "12");
/// ```
#[derive(Debug, Clone, serde::Serialize)]
pub struct Violation {
    /// How bad it is.
    pub severity: ViolationSeverity,
    /// Which subsystem noticed it.
    pub kind: ViolationKind,
    /// What went wrong.
    pub message: String,
    /// Source location (file:line) that reported it.
    pub location: &'static str,
    /// Sequence of the datagram involved, if any.
    #[serde(serialize_with = "sequence_serializer::serialize")]
    pub sequence: Option<SequenceNumber>,
    /// Additional key-value context.
    pub context: BTreeMap<String, String>,
}

impl Violation {
    /// Creates a violation without sequence or context.
    #[must_use]
    pub fn new(
        severity: ViolationSeverity,
        kind: ViolationKind,
        message: impl Into<String>,
        location: &'static str,
    ) -> Self {
        Self {
            severity,
            kind,
            message: message.into(),
            location,
            sequence: None,
            context: BTreeMap::new(),
        }
    }

    /// Attaches the sequence of the datagram involved.
    #[must_use]
    pub fn with_sequence(mut self, sequence: SequenceNumber) -> Self {
        self.sequence = Some(sequence);
        self
    }

    /// Adds a context key-value pair.
    #[must_use]
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }
}

impl std::fmt::Display for Violation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[{}/{}] {} (at {}",
            self.severity, self.kind, self.message, self.location
        )?;
        if let Some(sequence) = self.sequence {
            write!(f, ", sequence={sequence}")?;
        }
        if !self.context.is_empty() {
            write!(f, ", context={:?}", self.context)?;
        }
        write!(f, ")")
    }
}

/// Receives violations.
///
/// Sessions run a background thread, so observers must be shareable across
/// threads.
///
/// ```
/// use netchan_client::telemetry::{Violation, ViolationObserver};
///
/// struct Counter(std::sync::atomic::AtomicUsize);
///
/// impl ViolationObserver for Counter {
///     fn on_violation(&self, _violation: &Violation) {
///         self.0.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
///     }
/// }
/// ```
pub trait ViolationObserver: Send + Sync {
    /// Called for each violation. Keep it quick: it runs on the receive loop.
    fn on_violation(&self, violation: &Violation);
}

/// Logs violations through `tracing`.
///
/// `Warning` maps to `warn!`, `Error` and `Critical` map to `error!`. All
/// fields are emitted as structured tracing fields.
#[derive(Debug, Default, Clone)]
pub struct TracingObserver;

impl TracingObserver {
    /// Creates a tracing observer.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    fn format_sequence(sequence: Option<SequenceNumber>) -> String {
        sequence.map_or_else(|| "null".to_string(), |s| s.to_string())
    }
}

impl ViolationObserver for TracingObserver {
    fn on_violation(&self, violation: &Violation) {
        let severity = violation.severity.as_str();
        let kind = violation.kind.as_str();
        let location = violation.location;
        let sequence = Self::format_sequence(violation.sequence);

        let context_str = if violation.context.is_empty() {
            "{}".to_string()
        } else {
            let pairs: Vec<String> = violation
                .context
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect();
            format!("{{{}}}", pairs.join(", "))
        };

        match violation.severity {
            ViolationSeverity::Warning => {
                tracing::warn!(
                    severity,
                    kind,
                    location,
                    sequence = %sequence,
                    context = %context_str,
                    "{}",
                    violation.message
                );
            },
            ViolationSeverity::Error | ViolationSeverity::Critical => {
                tracing::error!(
                    severity,
                    kind,
                    location,
                    sequence = %sequence,
                    context = %context_str,
                    "{}",
                    violation.message
                );
            },
        }
    }
}

/// Stores violations for later inspection. Meant for tests.
///
/// ```
/// use netchan_client::telemetry::{
///     CollectingObserver, Violation, ViolationKind, ViolationObserver, ViolationSeverity,
/// };
///
/// let observer = CollectingObserver::new();
/// observer.on_violation(&Violation::new(
///     ViolationSeverity::Warning,
///     ViolationKind::Reliability,
///     "slow ack",
///     "test.rs:1",
/// ));
/// assert_eq!(observer.len(), 1);
/// assert!(observer.has_violation(ViolationKind::Reliability));
/// ```
#[derive(Debug, Default)]
pub struct CollectingObserver {
    violations: Mutex<Vec<Violation>>,
}

impl CollectingObserver {
    /// Creates an empty collector.
    #[must_use]
    pub fn new() -> Self {
        Self {
            violations: Mutex::new(Vec::new()),
        }
    }

    /// Copy of everything collected so far.
    #[must_use]
    pub fn violations(&self) -> Vec<Violation> {
        self.violations.lock().clone()
    }

    /// Number of collected violations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.violations.lock().len()
    }

    /// Whether nothing has been collected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.violations.lock().is_empty()
    }

    /// Whether any violation of `kind` was collected.
    #[must_use]
    pub fn has_violation(&self, kind: ViolationKind) -> bool {
        self.violations.lock().iter().any(|v| v.kind == kind)
    }

    /// All violations of `kind`.
    #[must_use]
    pub fn violations_of_kind(&self, kind: ViolationKind) -> Vec<Violation> {
        self.violations
            .lock()
            .iter()
            .filter(|v| v.kind == kind)
            .cloned()
            .collect()
    }

    /// Forgets everything collected.
    pub fn clear(&self) {
        self.violations.lock().clear();
    }
}

impl ViolationObserver for CollectingObserver {
    fn on_violation(&self, violation: &Violation) {
        self.violations.lock().push(violation.clone());
    }
}

/// Reports a violation with the caller's location to the [`TracingObserver`].
///
/// ```
/// use netchan_client::{report_violation, telemetry::{ViolationKind, ViolationSeverity}};
///
/// report_violation!(
///     ViolationSeverity::Warning,
///     ViolationKind::NetworkProtocol,
///     "no decoder for tag {}",
///     3
/// );
/// ```
#[macro_export]
macro_rules! report_violation {
    ($severity:expr, $kind:expr, $msg:literal) => {{
        use $crate::telemetry::ViolationObserver as _;
        let violation = $crate::telemetry::Violation::new(
            $severity,
            $kind,
            $msg,
            concat!(file!(), ":", line!()),
        );
        $crate::telemetry::TracingObserver.on_violation(&violation);
    }};

    ($severity:expr, $kind:expr, $fmt:literal, $($arg:tt)+) => {{
        use $crate::telemetry::ViolationObserver as _;
        let violation = $crate::telemetry::Violation::new(
            $severity,
            $kind,
            format!($fmt, $($arg)+),
            concat!(file!(), ":", line!()),
        );
        $crate::telemetry::TracingObserver.on_violation(&violation);
    }};
}

/// Asserts that an observer collected nothing.
#[macro_export]
macro_rules! assert_no_violations {
    ($observer:expr) => {{
        let violations = $observer.violations();
        assert!(
            violations.is_empty(),
            "Expected no violations, but found {}:\n{:#?}",
            violations.len(),
            violations
        );
    }};
}

/// Asserts that an observer collected a violation of the given kind.
#[macro_export]
macro_rules! assert_violation {
    ($observer:expr, $kind:expr) => {{
        assert!(
            $observer.has_violation($kind),
            "Expected violation of kind {:?}, but found: {:#?}",
            $kind,
            $observer.violations()
        );
    }};
}

/// Sends `violation` to `observer`, or to [`TracingObserver`] when `None`.
pub fn report_to_observer<O: ViolationObserver + ?Sized>(
    observer: Option<&Arc<O>>,
    violation: &Violation,
) {
    match observer {
        Some(obs) => obs.on_violation(violation),
        None => TracingObserver.on_violation(violation),
    }
}

/// Like [`report_violation!`] but routed through an optional observer.
///
/// A `sequence = ...` argument ahead of the message attaches the sequence
/// of the datagram involved.
///
/// ```
/// use netchan_client::{report_violation_to, telemetry::{
///     CollectingObserver, ViolationKind, ViolationObserver, ViolationSeverity,
/// }};
/// use std::sync::Arc;
///
/// let collector = Arc::new(CollectingObserver::new());
/// let observer: Option<Arc<dyn ViolationObserver>> = Some(collector.clone());
/// report_violation_to!(&observer, ViolationSeverity::Warning, ViolationKind::Handshake,
///     "unexpected reply {:?}", "hello");
/// assert_eq!(collector.len(), 1);
/// ```
#[macro_export]
macro_rules! report_violation_to {
    ($observer:expr, $severity:expr, $kind:expr, sequence = $seq:expr, $fmt:literal $(, $arg:expr)* $(,)?) => {{
        let violation = $crate::telemetry::Violation::new(
            $severity,
            $kind,
            format!($fmt $(, $arg)*),
            concat!(file!(), ":", line!()),
        )
        .with_sequence($seq);
        $crate::telemetry::report_to_observer($observer.as_ref(), &violation);
    }};

    ($observer:expr, $severity:expr, $kind:expr, $msg:literal) => {{
        let violation = $crate::telemetry::Violation::new(
            $severity,
            $kind,
            $msg,
            concat!(file!(), ":", line!()),
        );
        $crate::telemetry::report_to_observer($observer.as_ref(), &violation);
    }};

    ($observer:expr, $severity:expr, $kind:expr, $fmt:literal, $($arg:tt)+) => {{
        let violation = $crate::telemetry::Violation::new(
            $severity,
            $kind,
            format!($fmt, $($arg)+),
            concat!(file!(), ":", line!()),
        );
        $crate::telemetry::report_to_observer($observer.as_ref(), &violation);
    }};
}

#[cfg(test)]
#[allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;

    fn warning(kind: ViolationKind) -> Violation {
        Violation::new(ViolationSeverity::Warning, kind, "test", "test.rs:1")
    }

    #[test]
    fn severity_ordering() {
        assert!(ViolationSeverity::Warning < ViolationSeverity::Error);
        assert!(ViolationSeverity::Error < ViolationSeverity::Critical);
    }

    #[test]
    fn display_includes_sequence_and_context() {
        let violation = warning(ViolationKind::NetworkProtocol)
            .with_sequence(SequenceNumber::new(7, true))
            .with_context("tag", "3");
        let text = violation.to_string();
        assert!(text.starts_with("[warning/network_protocol] test (at test.rs:1"));
        assert!(text.contains("sequence=7R"));
        assert!(text.contains("\"tag\""));
    }

    #[test]
    fn collecting_observer_filters_by_kind() {
        let observer = CollectingObserver::new();
        observer.on_violation(&warning(ViolationKind::Handshake));
        observer.on_violation(&warning(ViolationKind::Reliability));
        observer.on_violation(&warning(ViolationKind::Handshake));
        assert_eq!(observer.len(), 3);
        assert_eq!(observer.violations_of_kind(ViolationKind::Handshake).len(), 2);
        assert!(!observer.has_violation(ViolationKind::InternalError));
        observer.clear();
        assert!(observer.is_empty());
    }

    #[test]
    fn report_violation_to_uses_observer() {
        let collector = Arc::new(CollectingObserver::new());
        let observer: Option<Arc<dyn ViolationObserver>> = Some(collector.clone());
        report_violation_to!(
            &observer,
            ViolationSeverity::Error,
            ViolationKind::Reliability,
            "{} retransmissions",
            40
        );
        let collected = collector.violations();
        assert_eq!(collected.len(), 1);
        assert_eq!(collected[0].message, "40 retransmissions");
        assert_eq!(collected[0].severity, ViolationSeverity::Error);
    }

    #[test]
    fn report_violation_to_attaches_sequence() {
        let collector = Arc::new(CollectingObserver::new());
        let observer: Option<Arc<dyn ViolationObserver>> = Some(collector.clone());
        report_violation_to!(
            &observer,
            ViolationSeverity::Error,
            ViolationKind::Reliability,
            sequence = SequenceNumber::new(31, true),
            "unacknowledged after {} retransmissions",
            4
        );
        let collected = collector.violations();
        assert_eq!(collected[0].sequence, Some(SequenceNumber::new(31, true)));
        assert_eq!(collected[0].message, "unacknowledged after 4 retransmissions");
    }

    #[test]
    fn report_violation_to_without_observer_logs() {
        let observer: Option<Arc<dyn ViolationObserver>> = None;
        report_violation_to!(
            &observer,
            ViolationSeverity::Warning,
            ViolationKind::Handshake,
            "logged only"
        );
    }

    #[test]
    fn assertion_macros() {
        let observer = CollectingObserver::new();
        assert_no_violations!(observer);
        observer.on_violation(&warning(ViolationKind::Handshake));
        assert_violation!(observer, ViolationKind::Handshake);
    }

    #[test]
    fn serialized_fields() {
        let value = serde_json::to_value(
            warning(ViolationKind::NetworkProtocol).with_context("tag", "99"),
        )
        .unwrap();
        assert_eq!(value["kind"], "network_protocol");
        assert_eq!(value["sequence"], serde_json::Value::Null);
        assert_eq!(value["context"]["tag"], "99");
    }
}
