//! The pure acquisition rule for lease locks, factored out of the API calls
//! so the mutual-exclusion behavior is testable with plain values.

use chrono::{DateTime, Duration, Utc};
use k8s_openapi::api::coordination::v1::LeaseSpec;

use super::LEASE_DURATION;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaseDecision {
    /// Someone else holds the lease and it has not expired.
    Refuse { holder: String },
    /// Write the lease with our identity: either renewing our own hold
    /// (acquire time preserved) or taking over an expired one (transition
    /// counter bumped).
    Renew {
        acquire: DateTime<Utc>,
        transitions: i32,
    },
}

/// Decides what to do with an existing lease at wall-clock `now`.
pub fn decide(current: &LeaseSpec, our_id: &str, now: DateTime<Utc>) -> LeaseDecision {
    let holder = current.holder_identity.as_deref().unwrap_or("");
    let fresh = current
        .renew_time
        .as_ref()
        .map(|renew| renew.0 + Duration::from_std(LEASE_DURATION).unwrap_or_default() > now)
        .unwrap_or(false);

    if !holder.is_empty() && holder != our_id && fresh {
        return LeaseDecision::Refuse {
            holder: holder.to_string(),
        };
    }

    let transitions = current.lease_transitions.unwrap_or(0);
    if holder == our_id {
        LeaseDecision::Renew {
            acquire: current
                .acquire_time
                .as_ref()
                .map(|t| t.0)
                .unwrap_or(now),
            transitions,
        }
    } else {
        LeaseDecision::Renew {
            acquire: now,
            transitions: transitions + 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::MicroTime;

    fn spec(holder: &str, renewed_secs_ago: i64, transitions: i32) -> LeaseSpec {
        let now = Utc::now();
        LeaseSpec {
            holder_identity: Some(holder.to_string()),
            renew_time: Some(MicroTime(now - Duration::seconds(renewed_secs_ago))),
            acquire_time: Some(MicroTime(now - Duration::seconds(600))),
            lease_duration_seconds: Some(5),
            lease_transitions: Some(transitions),
            ..Default::default()
        }
    }

    #[test]
    fn fresh_foreign_lease_is_refused() {
        let decision = decide(&spec("other", 1, 3), "us", Utc::now());
        assert_eq!(
            decision,
            LeaseDecision::Refuse {
                holder: "other".to_string()
            }
        );
    }

    #[test]
    fn expired_foreign_lease_is_taken_over() {
        let now = Utc::now();
        match decide(&spec("other", 60, 3), "us", now) {
            LeaseDecision::Renew {
                acquire,
                transitions,
            } => {
                assert_eq!(acquire, now, "takeover resets the acquire time");
                assert_eq!(transitions, 4, "takeover bumps the counter");
            }
            other => panic!("expected takeover, got {other:?}"),
        }
    }

    #[test]
    fn own_lease_renews_and_preserves_acquire_time() {
        let current = spec("us", 1, 3);
        let original_acquire = current.acquire_time.as_ref().unwrap().0;
        match decide(&current, "us", Utc::now()) {
            LeaseDecision::Renew {
                acquire,
                transitions,
            } => {
                assert_eq!(acquire, original_acquire);
                assert_eq!(transitions, 3);
            }
            other => panic!("expected renewal, got {other:?}"),
        }
    }

    #[test]
    fn empty_holder_is_claimable() {
        let current = LeaseSpec::default();
        match decide(&current, "us", Utc::now()) {
            LeaseDecision::Renew { transitions, .. } => assert_eq!(transitions, 1),
            other => panic!("expected claim, got {other:?}"),
        }
    }

    /// Two distinct identities racing over the same fresh lease: exactly one
    /// side sees its own hold, the other is refused until expiry.
    #[test]
    fn mutual_exclusion_between_two_identities() {
        let now = Utc::now();
        let held_by_a = spec("a", 1, 1);

        assert!(matches!(
            decide(&held_by_a, "a", now),
            LeaseDecision::Renew { .. }
        ));
        assert!(matches!(
            decide(&held_by_a, "b", now),
            LeaseDecision::Refuse { .. }
        ));

        // After the holder stops renewing past the lease duration, the other
        // identity may take over.
        let expired = spec("a", 6, 1);
        assert!(matches!(
            decide(&expired, "b", now),
            LeaseDecision::Renew { transitions: 2, .. }
        ));
    }
}
