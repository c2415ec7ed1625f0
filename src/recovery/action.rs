//! Recovery actions and their lifecycle.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::error::ErrorCode;
use crate::systems::ExternalSystemType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryKind {
    /// Marker only; the dispatcher re-enqueues the call under its own retry policy.
    Retry,
    RefreshToken,
    ResetConnection,
    DisableIntegration,
}

impl RecoveryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecoveryKind::Retry => "retry",
            RecoveryKind::RefreshToken => "refresh_token",
            RecoveryKind::ResetConnection => "reset_connection",
            RecoveryKind::DisableIntegration => "disable_integration",
        }
    }
}

impl fmt::Display for RecoveryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown recovery action kind '{0}'")]
pub struct UnknownRecoveryKind(pub String);

impl FromStr for RecoveryKind {
    type Err = UnknownRecoveryKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "retry" => Ok(RecoveryKind::Retry),
            "refresh_token" => Ok(RecoveryKind::RefreshToken),
            "reset_connection" => Ok(RecoveryKind::ResetConnection),
            "disable_integration" => Ok(RecoveryKind::DisableIntegration),
            other => Err(UnknownRecoveryKind(other.to_string())),
        }
    }
}

/// A scheduled, bounded-attempt remediation task for one (tenant, system) pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryAction {
    pub id: Uuid,
    pub kind: RecoveryKind,
    pub tenant_id: Option<Uuid>,
    pub system: ExternalSystemType,
    pub scheduled_at: DateTime<Utc>,
    pub attempts: u32,
    pub max_attempts: u32,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub success: bool,
    pub last_error: Option<String>,
    pub error_code: Option<ErrorCode>,
    pub created_at: DateTime<Utc>,
    /// Set when the action is closed without succeeding, e.g. on manual re-enable.
    pub retired_at: Option<DateTime<Utc>>,
}

impl RecoveryAction {
    pub fn new(
        kind: RecoveryKind,
        tenant_id: Option<Uuid>,
        system: ExternalSystemType,
        max_attempts: u32,
        scheduled_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            tenant_id,
            system,
            scheduled_at,
            attempts: 0,
            max_attempts,
            last_attempt_at: None,
            success: false,
            last_error: None,
            error_code: None,
            created_at: now,
            retired_at: None,
        }
    }

    pub fn with_error_code(mut self, code: ErrorCode) -> Self {
        self.error_code = Some(code);
        self
    }

    pub fn is_exhausted(&self) -> bool {
        self.attempts >= self.max_attempts
    }

    /// Neither successful nor retired. Open actions block equivalent new ones.
    pub fn is_open(&self) -> bool {
        !self.success && self.retired_at.is_none()
    }

    /// Open and still has attempts left.
    pub fn is_pending(&self) -> bool {
        self.is_open() && !self.is_exhausted()
    }

    pub fn retire(&mut self, now: DateTime<Utc>) {
        self.retired_at = Some(now);
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.is_pending() && self.scheduled_at <= now
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_names_round_trip_through_storage_form() {
        for kind in [
            RecoveryKind::Retry,
            RecoveryKind::RefreshToken,
            RecoveryKind::ResetConnection,
            RecoveryKind::DisableIntegration,
        ] {
            assert_eq!(kind.as_str().parse::<RecoveryKind>(), Ok(kind));
        }
        assert!("reboot".parse::<RecoveryKind>().is_err());
    }

    #[test]
    fn due_only_while_pending() {
        let now = Utc::now();
        let mut action = RecoveryAction::new(
            RecoveryKind::Retry,
            None,
            ExternalSystemType::Toast,
            2,
            now,
            now,
        );
        assert!(action.is_due(now));
        assert!(!action.is_due(now - chrono::TimeDelta::seconds(1)));

        action.attempts = 2;
        assert!(action.is_exhausted());
        assert!(!action.is_due(now));

        action.attempts = 1;
        action.success = true;
        assert!(!action.is_pending());
    }

    #[test]
    fn retired_actions_are_closed() {
        let now = Utc::now();
        let mut action = RecoveryAction::new(
            RecoveryKind::RefreshToken,
            Some(Uuid::new_v4()),
            ExternalSystemType::Square,
            3,
            now,
            now,
        );
        action.attempts = 3;
        assert!(action.is_open());

        action.retire(now);
        assert!(!action.is_open());
        assert!(!action.is_pending());
        assert!(!action.is_due(now));
    }
}
