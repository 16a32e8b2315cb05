//! Error classification and recovery actions

use serde::Serialize;

/// Broad failure category driving retry and circuit breaker decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Network,
    Timeout,
    ServiceUnavailable,
    RateLimited,
    Authentication,
    Validation,
    Protocol,
    ResourceExhausted,
    CircuitOpen,
    Internal,
}

impl ErrorKind {
    /// Transient failures worth retrying. Only these count toward opening a circuit.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorKind::Network
                | ErrorKind::Timeout
                | ErrorKind::ServiceUnavailable
                | ErrorKind::RateLimited
                | ErrorKind::Internal
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Network => "network",
            ErrorKind::Timeout => "timeout",
            ErrorKind::ServiceUnavailable => "service_unavailable",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::Authentication => "authentication",
            ErrorKind::Validation => "validation",
            ErrorKind::Protocol => "protocol",
            ErrorKind::ResourceExhausted => "resource_exhausted",
            ErrorKind::CircuitOpen => "circuit_open",
            ErrorKind::Internal => "internal",
        }
    }

    /// Severity of a failure seen on the given 1-based attempt
    pub fn severity(&self, attempt: u32) -> ErrorSeverity {
        if attempt >= 3 {
            return ErrorSeverity::Critical;
        }
        match self {
            ErrorKind::Authentication => ErrorSeverity::High,
            ErrorKind::Network | ErrorKind::ServiceUnavailable => {
                if attempt <= 1 {
                    ErrorSeverity::Medium
                } else {
                    ErrorSeverity::High
                }
            }
            _ => ErrorSeverity::Low,
        }
    }

    /// Candidate recovery actions, highest priority first
    pub fn recovery_actions(&self) -> Vec<RecoveryAction> {
        use RecoveryActionKind::*;

        match self {
            ErrorKind::Network => vec![
                RecoveryAction::auto(CheckConnectivity, "Verify network connectivity", 1),
                RecoveryAction::auto(RetryWithBackoff, "Retry with exponential backoff", 2),
                RecoveryAction::manual(SwitchToOffline, "Degrade to offline mode", 3),
            ],
            ErrorKind::Timeout => vec![
                RecoveryAction::auto(RetryWithLongerTimeout, "Retry with a longer timeout", 1),
                RecoveryAction::auto(CheckConnectivity, "Verify network connectivity", 2),
            ],
            ErrorKind::ServiceUnavailable => vec![
                RecoveryAction::auto(HealthCheck, "Check remote service health", 1),
                RecoveryAction::manual(UseFallbackService, "Switch to a fallback service", 2),
            ],
            ErrorKind::RateLimited => vec![RecoveryAction::auto(
                RetryWithBackoff,
                "Back off until the rate limit resets",
                1,
            )],
            ErrorKind::Authentication => vec![RecoveryAction::manual(
                RefreshCredentials,
                "Refresh session credentials",
                1,
            )],
            ErrorKind::Validation | ErrorKind::Protocol => vec![RecoveryAction::manual(
                Report,
                "Report the rejected message",
                1,
            )],
            ErrorKind::ResourceExhausted => vec![RecoveryAction::manual(
                WaitForCapacity,
                "Wait for pool capacity",
                1,
            )],
            ErrorKind::CircuitOpen => vec![RecoveryAction::manual(
                WaitForCircuitRecovery,
                "Wait for the circuit breaker to recover",
                1,
            )],
            ErrorKind::Internal => vec![RecoveryAction::auto(
                RetryWithBackoff,
                "Retry with exponential backoff",
                1,
            )],
        }
    }

    /// Best-effort classification of an opaque error message
    pub fn from_message(message: &str) -> Self {
        let message = message.to_lowercase();

        if message.contains("timeout") || message.contains("timed out") {
            ErrorKind::Timeout
        } else if message.contains("network") || message.contains("connection") {
            ErrorKind::Network
        } else if message.contains("auth") || message.contains("permission") {
            ErrorKind::Authentication
        } else if message.contains("validation") || message.contains("invalid") {
            ErrorKind::Validation
        } else if message.contains("rate limit") || message.contains("429") {
            ErrorKind::RateLimited
        } else if message.contains("service unavailable") || message.contains("503") {
            ErrorKind::ServiceUnavailable
        } else {
            ErrorKind::Internal
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Anything that can tell the recovery controller what kind of failure it is
pub trait Classify {
    fn kind(&self) -> ErrorKind;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryActionKind {
    CheckConnectivity,
    RetryWithBackoff,
    RetryWithLongerTimeout,
    HealthCheck,
    SwitchToOffline,
    UseFallbackService,
    RefreshCredentials,
    WaitForCapacity,
    WaitForCircuitRecovery,
    Report,
}

impl RecoveryActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecoveryActionKind::CheckConnectivity => "check_connectivity",
            RecoveryActionKind::RetryWithBackoff => "retry_with_backoff",
            RecoveryActionKind::RetryWithLongerTimeout => "retry_with_longer_timeout",
            RecoveryActionKind::HealthCheck => "health_check",
            RecoveryActionKind::SwitchToOffline => "switch_to_offline",
            RecoveryActionKind::UseFallbackService => "use_fallback_service",
            RecoveryActionKind::RefreshCredentials => "refresh_credentials",
            RecoveryActionKind::WaitForCapacity => "wait_for_capacity",
            RecoveryActionKind::WaitForCircuitRecovery => "wait_for_circuit_recovery",
            RecoveryActionKind::Report => "report",
        }
    }
}

/// A suggested step toward recovering from a failure
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecoveryAction {
    pub kind: RecoveryActionKind,
    pub description: &'static str,
    /// Executed by the controller before the next retry
    pub auto_executable: bool,
    /// Lower runs first
    pub priority: u8,
}

impl RecoveryAction {
    fn auto(kind: RecoveryActionKind, description: &'static str, priority: u8) -> Self {
        Self {
            kind,
            description,
            auto_executable: true,
            priority,
        }
    }

    fn manual(kind: RecoveryActionKind, description: &'static str, priority: u8) -> Self {
        Self {
            kind,
            description,
            auto_executable: false,
            priority,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_kinds() {
        assert!(ErrorKind::Network.is_retryable());
        assert!(ErrorKind::Timeout.is_retryable());
        assert!(ErrorKind::RateLimited.is_retryable());
        assert!(!ErrorKind::Authentication.is_retryable());
        assert!(!ErrorKind::Protocol.is_retryable());
        assert!(!ErrorKind::CircuitOpen.is_retryable());
        assert!(!ErrorKind::ResourceExhausted.is_retryable());
    }

    #[test]
    fn test_severity_escalates_with_attempts() {
        assert_eq!(ErrorKind::Network.severity(1), ErrorSeverity::Medium);
        assert_eq!(ErrorKind::Network.severity(2), ErrorSeverity::High);
        assert_eq!(ErrorKind::Authentication.severity(1), ErrorSeverity::High);
        assert_eq!(ErrorKind::Validation.severity(1), ErrorSeverity::Low);
        assert_eq!(ErrorKind::Validation.severity(3), ErrorSeverity::Critical);
    }

    #[test]
    fn test_actions_sorted_by_priority() {
        for kind in [
            ErrorKind::Network,
            ErrorKind::Timeout,
            ErrorKind::ServiceUnavailable,
            ErrorKind::Internal,
        ] {
            let actions = kind.recovery_actions();
            assert!(!actions.is_empty());
            assert!(actions.windows(2).all(|w| w[0].priority <= w[1].priority));
        }

        let auth = ErrorKind::Authentication.recovery_actions();
        assert!(auth.iter().all(|a| !a.auto_executable));
    }

    #[test]
    fn test_from_message() {
        assert_eq!(ErrorKind::from_message("Connection reset by peer"), ErrorKind::Network);
        assert_eq!(ErrorKind::from_message("request timed out"), ErrorKind::Timeout);
        assert_eq!(ErrorKind::from_message("HTTP 429 Too Many Requests"), ErrorKind::RateLimited);
        assert_eq!(ErrorKind::from_message("Permission denied"), ErrorKind::Authentication);
        assert_eq!(ErrorKind::from_message("boom"), ErrorKind::Internal);
    }
}
