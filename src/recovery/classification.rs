//! Error-code to remediation mapping and per-kind retry schedules.

use std::time::Duration;

use crate::error::{ErrorCode, IntegrationError};

use super::action::RecoveryKind;

const RETRY_DELAYS: [Duration; 5] = [
    Duration::from_secs(1),
    Duration::from_secs(5),
    Duration::from_secs(15),
    Duration::from_secs(60),
    Duration::from_secs(300),
];
const REFRESH_DELAYS: [Duration; 3] = [
    Duration::from_secs(5),
    Duration::from_secs(30),
    Duration::from_secs(120),
];
const RESET_DELAYS: [Duration; 2] = [Duration::from_secs(10), Duration::from_secs(60)];
const DISABLE_DELAYS: [Duration; 1] = [Duration::ZERO];

/// Remediation chosen for one classified failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryPlan {
    pub kind: RecoveryKind,
    pub max_attempts: u32,
}

/// `None` means the failure is fatal and is only surfaced.
pub fn classify(error: &IntegrationError) -> Option<RecoveryPlan> {
    let plan = |kind, max_attempts| Some(RecoveryPlan { kind, max_attempts });
    match error.code {
        ErrorCode::AuthError => plan(RecoveryKind::RefreshToken, 3),
        ErrorCode::RateLimited | ErrorCode::ConnectionError | ErrorCode::Timeout => {
            plan(RecoveryKind::Retry, 5)
        }
        ErrorCode::ServerError => plan(RecoveryKind::ResetConnection, 2),
        _ if error.retryable => plan(RecoveryKind::Retry, 5),
        _ => None,
    }
}

pub fn delays(kind: RecoveryKind) -> &'static [Duration] {
    match kind {
        RecoveryKind::Retry => &RETRY_DELAYS,
        RecoveryKind::RefreshToken => &REFRESH_DELAYS,
        RecoveryKind::ResetConnection => &RESET_DELAYS,
        RecoveryKind::DisableIntegration => &DISABLE_DELAYS,
    }
}

/// Delay before the attempt following `attempts` completed ones, clamped to the last entry.
pub fn delay_for(kind: RecoveryKind, attempts: u32) -> Duration {
    let schedule = delays(kind);
    let index = (attempts as usize).min(schedule.len() - 1);
    schedule[index]
}
