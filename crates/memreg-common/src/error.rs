use thiserror::Error;

/// Regulator error types covering configuration, collaborator and lifecycle failures.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum RegError {
    /// Configuration rejected at startup; the engine refuses to start.
    #[error("configuration error: {0}")]
    Config(String),

    /// The bandwidth counter for a core could not be created.
    ///
    /// Non-fatal: the core is excluded from regulation.
    #[error("counter unavailable on core {core}: {reason}")]
    CounterUnavailable {
        /// Core the counter was requested for.
        core: usize,
        /// Collaborator-provided reason.
        reason: String,
    },

    /// The GPU profiler channel was closed by the peer.
    #[error("GPU sample channel closed")]
    ChannelClosed,

    /// Operation observed the engine shutdown flag.
    #[error("regulator is shutting down")]
    Shutdown,

    /// Worker or timer could not be acquired during startup.
    #[error("resource acquisition failed: {0}")]
    Resource(String),

    /// Invalid lifecycle transition attempted.
    #[error("invalid state transition from {from} to {to}")]
    InvalidStateTransition {
        /// Source state.
        from: String,
        /// Attempted target state.
        to: String,
    },

    /// I/O error from a collaborator (record files, profiler transport).
    #[error("I/O error: {0}")]
    Io(String),
}

impl RegError {
    /// Returns true if this error from a collaborator must abort engine startup.
    ///
    /// Non-fatal errors only drop the affected core or GPU channel.
    #[must_use]
    pub fn is_fatal_at_startup(&self) -> bool {
        !matches!(
            self,
            Self::CounterUnavailable { .. } | Self::ChannelClosed | Self::Io(_)
        )
    }
}

/// Convenience type alias for regulator operations.
pub type RegResult<T> = Result<T, RegError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatality_classification() {
        assert!(RegError::Config("bad".into()).is_fatal_at_startup());
        assert!(RegError::Resource("spawn".into()).is_fatal_at_startup());
        assert!(!RegError::ChannelClosed.is_fatal_at_startup());
        assert!(!RegError::Io("connection reset".into()).is_fatal_at_startup());
        assert!(!RegError::CounterUnavailable {
            core: 2,
            reason: "not supported".into()
        }
        .is_fatal_at_startup());
    }

    #[test]
    fn test_display() {
        let err = RegError::CounterUnavailable {
            core: 5,
            reason: "no such event".into(),
        };
        assert_eq!(err.to_string(), "counter unavailable on core 5: no such event");
    }
}
