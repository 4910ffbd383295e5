//! Per-user send gate: minimum interval between sends, enforced with an
//! arithmetic challenge.
//!
//! The last-send map and the challenge table live behind one lock, so the
//! interval check, challenge issuance and challenge redemption can never
//! interleave for the same user.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use agora_shared::types::{RoomId, UserId};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::Rng;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;

/// A send captured verbatim when a challenge is issued, replayed once the
/// challenge is solved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingSend {
    pub room_id: RoomId,
    /// Already sanitized.
    pub content: String,
    pub client_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Accepted(PendingSend),
    Challenged { captcha_id: String, question: String },
}

/// Why a redemption failed. Clients only ever see a generic message.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChallengeError {
    #[error("unknown challenge")]
    Unknown,
    #[error("challenge belongs to another user")]
    WrongOwner,
    #[error("challenge expired")]
    Expired,
    #[error("answer is not a number")]
    NotNumeric,
    #[error("wrong answer")]
    WrongAnswer,
}

struct PendingChallenge {
    answer: i64,
    owner: UserId,
    expires_at: Instant,
    payload: PendingSend,
}

#[derive(Default)]
struct GateState {
    last_send: HashMap<UserId, Instant>,
    challenges: HashMap<String, PendingChallenge>,
}

#[derive(Clone)]
pub struct SendGate {
    state: Arc<Mutex<GateState>>,
    interval: Duration,
    ttl: Duration,
}

impl SendGate {
    pub fn new(interval: Duration, ttl: Duration) -> Self {
        Self {
            state: Arc::new(Mutex::new(GateState::default())),
            interval,
            ttl,
        }
    }

    /// Admit a send that carries no challenge token.
    ///
    /// If the user's previous accepted send was less than the interval ago,
    /// the payload is parked under a new challenge and nothing is accepted.
    /// A user holds at most one open challenge; a new one replaces the last.
    pub async fn admit(&self, user: UserId, payload: PendingSend) -> Admission {
        let now = Instant::now();
        let mut state = self.state.lock().await;

        let too_soon = state
            .last_send
            .get(&user)
            .is_some_and(|last| now.saturating_duration_since(*last) < self.interval);

        if too_soon {
            let challenge = Challenge::generate();
            debug!(user = %user, room = %payload.room_id, "send too fast, issuing challenge");
            state.challenges.retain(|_, c| c.owner != user);
            state.challenges.insert(
                challenge.token.clone(),
                PendingChallenge {
                    answer: challenge.answer,
                    owner: user,
                    expires_at: now + self.ttl,
                    payload,
                },
            );
            return Admission::Challenged {
                captcha_id: challenge.token,
                question: challenge.question,
            };
        }

        state.last_send.insert(user, now);
        Admission::Accepted(payload)
    }

    /// Redeem a challenge. The token is consumed whatever the outcome; on
    /// success the payload stored at issuance is returned and counts as an
    /// accepted send.
    pub async fn redeem(
        &self,
        user: UserId,
        captcha_id: &str,
        answer: Option<i64>,
    ) -> Result<PendingSend, ChallengeError> {
        let now = Instant::now();
        let mut state = self.state.lock().await;

        let pending = state
            .challenges
            .remove(captcha_id)
            .ok_or(ChallengeError::Unknown)?;

        if pending.owner != user {
            return Err(ChallengeError::WrongOwner);
        }
        if now > pending.expires_at {
            return Err(ChallengeError::Expired);
        }
        match answer {
            None => return Err(ChallengeError::NotNumeric),
            Some(given) if given != pending.answer => return Err(ChallengeError::WrongAnswer),
            Some(_) => {}
        }

        state.last_send.insert(user, now);
        Ok(pending.payload)
    }

    /// Drop expired challenges and send-times older than the challenge TTL.
    /// Returns `(challenges, send_times)` removed.
    pub async fn purge_expired(&self) -> (usize, usize) {
        let now = Instant::now();
        let mut state = self.state.lock().await;

        let challenges_before = state.challenges.len();
        state.challenges.retain(|_, c| c.expires_at >= now);

        let sends_before = state.last_send.len();
        let ttl = self.ttl;
        state
            .last_send
            .retain(|_, last| now.saturating_duration_since(*last) < ttl);

        (
            challenges_before - state.challenges.len(),
            sends_before - state.last_send.len(),
        )
    }

    pub async fn pending_challenges(&self) -> usize {
        self.state.lock().await.challenges.len()
    }
}

struct Challenge {
    token: String,
    question: String,
    answer: i64,
}

impl Challenge {
    /// Two operands in `1..=9` joined by `+` or `-`, and an 8-byte URL-safe
    /// token.
    fn generate() -> Self {
        let mut rng = rand::thread_rng();
        let a: i64 = rng.gen_range(1..=9);
        let b: i64 = rng.gen_range(1..=9);
        let (op, answer) = if rng.gen_bool(0.5) {
            ('+', a + b)
        } else {
            ('-', a - b)
        };

        let mut raw = [0u8; 8];
        rng.fill(&mut raw);

        Self {
            token: URL_SAFE_NO_PAD.encode(raw),
            question: format!("{a}{op}{b} = ?"),
            answer,
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Compute the answer to a generated question such as `"7-3 = ?"`.
    pub(crate) fn solve(question: &str) -> i64 {
        let expr = question.trim_end_matches(" = ?");
        let (a, op, b) = (&expr[..1], &expr[1..2], &expr[2..]);
        let (a, b): (i64, i64) = (a.parse().unwrap(), b.parse().unwrap());
        if op == "+" {
            a + b
        } else {
            a - b
        }
    }

    fn payload(text: &str) -> PendingSend {
        PendingSend {
            room_id: RoomId(1),
            content: text.to_string(),
            client_id: Some("c-1".into()),
        }
    }

    fn challenged(admission: Admission) -> (String, String) {
        match admission {
            Admission::Challenged {
                captcha_id,
                question,
            } => (captcha_id, question),
            other => panic!("expected challenge, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_first_send_is_accepted() {
        let gate = SendGate::new(Duration::from_secs(60), Duration::from_secs(300));
        let admission = gate.admit(UserId(2), payload("hello")).await;
        assert_eq!(admission, Admission::Accepted(payload("hello")));
    }

    #[tokio::test]
    async fn test_rapid_second_send_is_challenged() {
        let gate = SendGate::new(Duration::from_secs(60), Duration::from_secs(300));
        gate.admit(UserId(2), payload("one")).await;
        let (id, question) = challenged(gate.admit(UserId(2), payload("two")).await);
        assert!(!id.is_empty());
        assert!(question.ends_with(" = ?"));
        assert_eq!(gate.pending_challenges().await, 1);

        // Other users are not affected.
        assert!(matches!(
            gate.admit(UserId(3), payload("x")).await,
            Admission::Accepted(_)
        ));
    }

    #[tokio::test]
    async fn test_new_challenge_replaces_open_one() {
        let gate = SendGate::new(Duration::from_secs(60), Duration::from_secs(300));
        gate.admit(UserId(2), payload("one")).await;
        let (stale, stale_question) = challenged(gate.admit(UserId(2), payload("two")).await);
        for i in 0..10 {
            challenged(gate.admit(UserId(2), payload(&format!("flood {i}"))).await);
        }
        gate.admit(UserId(3), payload("x")).await;
        challenged(gate.admit(UserId(3), payload("y")).await);

        assert_eq!(gate.pending_challenges().await, 2);
        assert_eq!(
            gate.redeem(UserId(2), &stale, Some(solve(&stale_question))).await,
            Err(ChallengeError::Unknown)
        );
    }

    #[tokio::test]
    async fn test_redeem_returns_stored_payload() {
        let gate = SendGate::new(Duration::from_secs(60), Duration::from_secs(300));
        gate.admit(UserId(2), payload("one")).await;
        let (id, question) = challenged(gate.admit(UserId(2), payload("original")).await);

        let replay = gate.redeem(UserId(2), &id, Some(solve(&question))).await.unwrap();
        assert_eq!(replay, payload("original"));
        assert_eq!(gate.pending_challenges().await, 0);
    }

    #[tokio::test]
    async fn test_token_consumed_on_failure() {
        let gate = SendGate::new(Duration::from_secs(60), Duration::from_secs(300));
        gate.admit(UserId(2), payload("one")).await;
        let (id, question) = challenged(gate.admit(UserId(2), payload("two")).await);
        let wrong = solve(&question) + 100;

        assert_eq!(
            gate.redeem(UserId(2), &id, Some(wrong)).await,
            Err(ChallengeError::WrongAnswer)
        );
        assert_eq!(
            gate.redeem(UserId(2), &id, Some(solve(&question))).await,
            Err(ChallengeError::Unknown)
        );
    }

    #[tokio::test]
    async fn test_redeem_rejects_other_user_and_non_numeric() {
        let gate = SendGate::new(Duration::from_secs(60), Duration::from_secs(300));
        gate.admit(UserId(2), payload("one")).await;
        let (id, question) = challenged(gate.admit(UserId(2), payload("two")).await);
        assert_eq!(
            gate.redeem(UserId(3), &id, Some(solve(&question))).await,
            Err(ChallengeError::WrongOwner)
        );

        let (id, _) = challenged(gate.admit(UserId(2), payload("three")).await);
        assert_eq!(
            gate.redeem(UserId(2), &id, None).await,
            Err(ChallengeError::NotNumeric)
        );
    }

    #[tokio::test]
    async fn test_expired_challenge_fails_closed() {
        let gate = SendGate::new(Duration::from_secs(60), Duration::ZERO);
        gate.admit(UserId(2), payload("one")).await;
        let (id, question) = challenged(gate.admit(UserId(2), payload("two")).await);
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(
            gate.redeem(UserId(2), &id, Some(solve(&question))).await,
            Err(ChallengeError::Expired)
        );
    }

    #[tokio::test]
    async fn test_purge_expired() {
        let gate = SendGate::new(Duration::from_secs(60), Duration::ZERO);
        gate.admit(UserId(2), payload("one")).await;
        gate.admit(UserId(2), payload("two")).await;
        tokio::time::sleep(Duration::from_millis(5)).await;

        let (challenges, sends) = gate.purge_expired().await;
        assert_eq!((challenges, sends), (1, 1));
        assert_eq!(gate.pending_challenges().await, 0);
    }

    #[test]
    fn test_generated_challenge_is_consistent() {
        for _ in 0..50 {
            let c = Challenge::generate();
            assert_eq!(solve(&c.question), c.answer);
            assert_eq!(c.token.len(), 11);
        }
    }
}
