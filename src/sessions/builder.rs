use std::sync::Arc;

use crate::network::messages::MessageCatalog;
use crate::recorder::DatagramRecorder;
use crate::sessions::client_id::ClientIdAllocator;
use crate::sessions::config::SessionConfig;
use crate::sessions::session::{Session, SessionParts};
use crate::telemetry::ViolationObserver;
use crate::world::{GameState, World, WorldObserver};
use crate::NetchanError;

/// Userinfo sent when the application does not supply one.
pub const DEFAULT_PROFILE: &str = "\\name\\netchan\\skin\\male/grunt\\rate\\25000\\msg\\1\\hand\\2";

/// The [`SessionBuilder`] builds [`Session`]s.
///
/// After setting all appropriate values, call [`build`](Self::build) and
/// then [`Session::connect`].
///
/// ```no_run
/// use netchan_client::{GameState, Session, SessionBuilder, SessionConfig, World};
///
/// let session: Session<GameState> = SessionBuilder::new()
///     .with_config(SessionConfig::lan())
///     .with_profile("\\name\\walker\\skin\\male/grunt")
///     .with_observer(|world: &GameState| {
///         tracing::info!(frame = ?world.current_frame_number(), "frame");
///     })
///     .build()?;
/// session.connect("127.0.0.1", 27910)?;
/// # Ok::<(), netchan_client::NetchanError>(())
/// ```
#[must_use = "SessionBuilder must be consumed by calling build()"]
pub struct SessionBuilder<W: World = GameState> {
    config: SessionConfig,
    /// Userinfo string embedded in the connect request.
    profile: String,
    catalog: MessageCatalog,
    allocator: Option<ClientIdAllocator>,
    recorder: Option<Arc<dyn DatagramRecorder>>,
    observers: Vec<Arc<dyn WorldObserver<W>>>,
    /// Optional observer for protocol violations.
    violation_observer: Option<Arc<dyn ViolationObserver>>,
}

impl<W: World> std::fmt::Debug for SessionBuilder<W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Destructure to ensure all fields are included when new fields are added.
        let Self {
            config,
            profile,
            catalog,
            allocator,
            recorder,
            observers,
            violation_observer,
        } = self;

        f.debug_struct("SessionBuilder")
            .field("config", config)
            .field("profile", profile)
            .field("catalog", catalog)
            .field("allocator", allocator)
            .field("has_recorder", &recorder.is_some())
            .field("observers", &observers.len())
            .field("has_violation_observer", &violation_observer.is_some())
            .finish()
    }
}

impl<W: World> Default for SessionBuilder<W> {
    fn default() -> Self {
        Self::new()
    }
}

impl<W: World> SessionBuilder<W> {
    /// Construct a new builder with all values set to their defaults.
    pub fn new() -> Self {
        Self {
            config: SessionConfig::default(),
            profile: DEFAULT_PROFILE.to_owned(),
            catalog: MessageCatalog::standard(),
            allocator: None,
            recorder: None,
            observers: Vec::new(),
            violation_observer: None,
        }
    }

    /// Sets the session configuration. Validated by [`build`](Self::build).
    pub fn with_config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the userinfo string (`\key\value` pairs) sent when connecting.
    pub fn with_profile(mut self, profile: impl Into<String>) -> Self {
        self.profile = profile.into();
        self
    }

    /// Replaces the message catalog, e.g. to add a temp-entity decoder.
    pub fn with_message_catalog(mut self, catalog: MessageCatalog) -> Self {
        self.catalog = catalog;
        self
    }

    /// Draws client ids from `allocator` instead of the process-wide pool.
    ///
    /// Without one, every session uses [`ClientIdAllocator::shared`], so two
    /// sessions in one process never connect with the same id.
    pub fn with_client_id_allocator(mut self, allocator: ClientIdAllocator) -> Self {
        self.allocator = Some(allocator);
        self
    }

    /// Taps every inbound datagram, e.g. with a
    /// [`FileRecorder`](crate::FileRecorder).
    pub fn with_recorder(mut self, recorder: impl DatagramRecorder + 'static) -> Self {
        self.recorder = Some(Arc::new(recorder));
        self
    }

    /// Adds an observer notified whenever the world advances a frame.
    pub fn with_observer(mut self, observer: impl WorldObserver<W> + 'static) -> Self {
        self.observers.push(Arc::new(observer));
        self
    }

    /// Sets a custom observer for protocol violations.
    ///
    /// Without one, violations are logged through `tracing`.
    ///
    /// ```
    /// use netchan_client::{Session, SessionBuilder};
    /// use netchan_client::telemetry::CollectingObserver;
    /// use std::sync::Arc;
    ///
    /// let observer = Arc::new(CollectingObserver::new());
    /// let session: Session = SessionBuilder::new()
    ///     .with_violation_observer(observer.clone())
    ///     .build()
    ///     .unwrap();
    /// assert!(observer.is_empty());
    /// # drop(session);
    /// ```
    pub fn with_violation_observer(mut self, observer: Arc<dyn ViolationObserver>) -> Self {
        self.violation_observer = Some(observer);
        self
    }

    /// Seeds the reconnect back-off jitter, for reproducible runs.
    pub fn with_rng_seed(mut self, seed: u64) -> Self {
        self.config.rng_seed = Some(seed);
        self
    }

    /// Consumes the builder to create a [`Session`].
    ///
    /// # Errors
    ///
    /// - [`NetchanError::InvalidConfig`] if the configuration is out of range.
    /// - [`NetchanError::InvalidRequest`] if the profile contains a quote or
    ///   a line break, which would corrupt the connect request.
    pub fn build(self) -> Result<Session<W>, NetchanError> {
        self.config.validate()?;
        if self.profile.contains(['"', '\n', '\r']) {
            return Err(NetchanError::InvalidRequest {
                info: "profile must not contain quotes or line breaks".to_owned(),
            });
        }
        let allocator = self.allocator.unwrap_or_else(ClientIdAllocator::shared);
        Ok(Session::from_parts(SessionParts {
            config: self.config,
            profile: self.profile,
            catalog: self.catalog,
            allocator,
            recorder: self.recorder,
            observers: self.observers,
            violation_observer: self.violation_observer,
        }))
    }
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
    use crate::network::messages::ServerOp;
    use crate::sessions::config::TransportConfig;
    use web_time::Duration;

    #[test]
    fn defaults_build() {
        let session: Session = SessionBuilder::new().build().unwrap();
        assert_eq!(*session.config(), SessionConfig::default());
    }

    #[test]
    fn invalid_config_is_rejected() {
        let config = SessionConfig {
            transport: TransportConfig {
                poll_interval: Duration::ZERO,
                ..TransportConfig::default()
            },
            ..SessionConfig::default()
        };
        let result: Result<Session, _> = SessionBuilder::new().with_config(config).build();
        assert!(matches!(result, Err(NetchanError::InvalidConfig { .. })));
    }

    #[test]
    fn quoted_profile_is_rejected() {
        let result: Result<Session, _> = SessionBuilder::new()
            .with_profile("\\name\\\"bot\"")
            .build();
        assert!(matches!(result, Err(NetchanError::InvalidRequest { .. })));
    }

    #[test]
    fn rng_seed_lands_in_config() {
        let session: Session = SessionBuilder::new().with_rng_seed(9).build().unwrap();
        assert_eq!(session.config().rng_seed, Some(9));
    }

    #[test]
    fn debug_lists_observers() {
        let builder: SessionBuilder = SessionBuilder::new()
            .with_observer(|_: &GameState| {})
            .with_observer(|_: &GameState| {})
            .with_message_catalog({
                let mut catalog = MessageCatalog::standard();
                catalog.unregister(ServerOp::Sound as u8);
                catalog
            });
        let text = format!("{builder:?}");
        assert!(text.contains("observers: 2"));
    }
}
