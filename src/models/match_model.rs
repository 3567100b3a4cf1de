use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Match lifecycle states. Persisted as lowercase text.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MatchStatus {
    Matched,
    Funding,
    Ready,
    Started,
    Completed,
    Cancelled,
    Refunded,
}

impl MatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchStatus::Matched => "matched",
            MatchStatus::Funding => "funding",
            MatchStatus::Ready => "ready",
            MatchStatus::Started => "started",
            MatchStatus::Completed => "completed",
            MatchStatus::Cancelled => "cancelled",
            MatchStatus::Refunded => "refunded",
        }
    }

    pub fn parse(raw: &str) -> Option<MatchStatus> {
        match raw {
            "matched" => Some(MatchStatus::Matched),
            "funding" => Some(MatchStatus::Funding),
            "ready" => Some(MatchStatus::Ready),
            "started" => Some(MatchStatus::Started),
            "completed" => Some(MatchStatus::Completed),
            "cancelled" => Some(MatchStatus::Cancelled),
            "refunded" => Some(MatchStatus::Refunded),
            _ => None,
        }
    }

    /// Check if transition to another state is valid.
    pub fn can_transition_to(&self, to: &MatchStatus) -> bool {
        use MatchStatus::*;
        match (self, to) {
            (Matched, Funding) | (Matched, Cancelled) => true,
            (Funding, Ready) | (Funding, Cancelled) | (Funding, Refunded) => true,
            (Ready, Started) | (Ready, Cancelled) | (Ready, Refunded) => true,
            (Started, Completed) | (Started, Cancelled) | (Started, Refunded) => true,
            // Free matches skip funding entirely.
            (Matched, Ready) => true,
            _ => false,
        }
    }

    pub fn valid_next_states(&self) -> Vec<MatchStatus> {
        use MatchStatus::*;
        match self {
            Matched => vec![Funding, Ready, Cancelled],
            Funding => vec![Ready, Cancelled, Refunded],
            Ready => vec![Started, Cancelled, Refunded],
            Started => vec![Completed, Cancelled, Refunded],
            Completed | Cancelled | Refunded => vec![],
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            MatchStatus::Completed | MatchStatus::Cancelled | MatchStatus::Refunded
        )
    }
}

impl std::fmt::Display for MatchStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Categorical outcome of a match, independent of winner identity.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ResultType {
    NormalWin,
    Tie,
    Player1Disqualified,
    Player2Disqualified,
    BothDisqualified,
    Player1Timeout,
    Player2Timeout,
    BothTimeoutTie,
    Player1SlowWin,
    Player2SlowWin,
}

impl ResultType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResultType::NormalWin => "normal_win",
            ResultType::Tie => "tie",
            ResultType::Player1Disqualified => "player1_disqualified",
            ResultType::Player2Disqualified => "player2_disqualified",
            ResultType::BothDisqualified => "both_disqualified",
            ResultType::Player1Timeout => "player1_timeout",
            ResultType::Player2Timeout => "player2_timeout",
            ResultType::BothTimeoutTie => "both_timeout_tie",
            ResultType::Player1SlowWin => "player1_slow_win",
            ResultType::Player2SlowWin => "player2_slow_win",
        }
    }

    /// Outcomes with no winner: both deposits become refund-eligible.
    pub fn is_no_winner(&self) -> bool {
        matches!(
            self,
            ResultType::Tie | ResultType::BothDisqualified | ResultType::BothTimeoutTie
        )
    }
}

impl std::fmt::Display for ResultType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ClaimStatus {
    Unclaimed,
    Claimed,
    Expired,
}

impl ClaimStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClaimStatus::Unclaimed => "unclaimed",
            ClaimStatus::Claimed => "claimed",
            ClaimStatus::Expired => "expired",
        }
    }

    pub fn parse(raw: &str) -> Option<ClaimStatus> {
        match raw {
            "unclaimed" => Some(ClaimStatus::Unclaimed),
            "claimed" => Some(ClaimStatus::Claimed),
            "expired" => Some(ClaimStatus::Expired),
            _ => None,
        }
    }
}

/// Which side of the match a user occupies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayerSlot {
    One,
    Two,
}

impl PlayerSlot {
    pub fn other(&self) -> PlayerSlot {
        match self {
            PlayerSlot::One => PlayerSlot::Two,
            PlayerSlot::Two => PlayerSlot::One,
        }
    }
}

/// The central match row.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct MatchEntity {
    pub id: Uuid,
    pub idempotency_key: Option<String>,
    pub player1_id: Uuid,
    pub player2_id: Uuid,
    pub player1_wallet: String,
    pub player2_wallet: String,
    pub stake_amount: Decimal,
    pub status: String,
    pub green_light_time: Option<i64>,
    pub signal_delay_ms: Option<i64>,
    pub winner_id: Option<Uuid>,
    pub result_type: Option<String>,
    pub completed_at: Option<DateTime<Utc>>,
    pub player1_ready: bool,
    pub player2_ready: bool,
    pub player1_ready_at: Option<DateTime<Utc>>,
    pub player2_ready_at: Option<DateTime<Utc>>,
    pub player1_staked: bool,
    pub player2_staked: bool,
    pub player1_disqualified: bool,
    pub player2_disqualified: bool,
    pub player1_reaction_ms: Option<i64>,
    pub player2_reaction_ms: Option<i64>,
    pub fee_amount: Option<Decimal>,
    pub claim_status: Option<String>,
    pub claim_deadline: Option<DateTime<Utc>>,
    pub winner_wallet: Option<String>,
    pub loser_wallet: Option<String>,
    pub player1_last_ping: Option<DateTime<Utc>>,
    pub player2_last_ping: Option<DateTime<Utc>>,
    pub player1_disconnects: i32,
    pub player2_disconnects: i32,
    pub cancel_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl MatchEntity {
    pub fn status(&self) -> Option<MatchStatus> {
        MatchStatus::parse(&self.status)
    }

    pub fn is_participant(&self, user_id: Uuid) -> bool {
        self.player1_id == user_id || self.player2_id == user_id
    }

    pub fn slot_of(&self, user_id: Uuid) -> Option<PlayerSlot> {
        if self.player1_id == user_id {
            Some(PlayerSlot::One)
        } else if self.player2_id == user_id {
            Some(PlayerSlot::Two)
        } else {
            None
        }
    }

    pub fn player_id(&self, slot: PlayerSlot) -> Uuid {
        match slot {
            PlayerSlot::One => self.player1_id,
            PlayerSlot::Two => self.player2_id,
        }
    }

    pub fn wallet(&self, slot: PlayerSlot) -> &str {
        match slot {
            PlayerSlot::One => &self.player1_wallet,
            PlayerSlot::Two => &self.player2_wallet,
        }
    }

    pub fn is_free(&self) -> bool {
        self.stake_amount.is_zero()
    }

    pub fn both_ready(&self) -> bool {
        self.player1_ready && self.player2_ready
    }

    pub fn both_staked(&self) -> bool {
        self.player1_staked && self.player2_staked
    }

    /// Tracing correlation id derived from the match identity and its
    /// creation instant.
    pub fn correlation_id(&self) -> String {
        correlation_id(self.id, self.created_at)
    }
}

pub fn correlation_id(match_id: Uuid, created_at: DateTime<Utc>) -> String {
    let hex = match_id.simple().to_string();
    format!("{}-{}", &hex[..8], created_at.timestamp_millis())
}

/// The slice of a tap that outcome determination needs.
#[derive(Debug, Clone, Copy)]
pub struct TapSummary {
    pub reaction_ms: i64,
    pub is_valid: bool,
    pub disqualified: bool,
}

/// Winner determination over two recorded taps. Returns the winning slot (if
/// any) and the categorical outcome.
pub fn determine_outcome(
    p1: TapSummary,
    p2: TapSummary,
    tie_threshold_ms: i64,
) -> (Option<PlayerSlot>, ResultType) {
    match (p1.disqualified, p2.disqualified) {
        (true, true) => return (None, ResultType::BothDisqualified),
        (true, false) => return (Some(PlayerSlot::Two), ResultType::Player1Disqualified),
        (false, true) => return (Some(PlayerSlot::One), ResultType::Player2Disqualified),
        (false, false) => {}
    }

    let delta = (p1.reaction_ms - p2.reaction_ms).abs();
    match (p1.is_valid, p2.is_valid) {
        (false, false) => {
            if delta <= tie_threshold_ms {
                (None, ResultType::BothTimeoutTie)
            } else if p1.reaction_ms < p2.reaction_ms {
                (Some(PlayerSlot::One), ResultType::Player1SlowWin)
            } else {
                (Some(PlayerSlot::Two), ResultType::Player2SlowWin)
            }
        }
        (false, true) => (Some(PlayerSlot::Two), ResultType::Player1Timeout),
        (true, false) => (Some(PlayerSlot::One), ResultType::Player2Timeout),
        (true, true) => {
            if delta <= tie_threshold_ms {
                (None, ResultType::Tie)
            } else if p1.reaction_ms < p2.reaction_ms {
                (Some(PlayerSlot::One), ResultType::NormalWin)
            } else {
                (Some(PlayerSlot::Two), ResultType::NormalWin)
            }
        }
    }
}

/// One-sided completion: only `present`'s tap exists and the window expired
/// (or the opponent disconnected past grace).
pub fn determine_one_sided_outcome(
    present: PlayerSlot,
    tap: TapSummary,
) -> (Option<PlayerSlot>, ResultType) {
    if tap.disqualified {
        return (None, ResultType::BothTimeoutTie);
    }
    // Present but too slow still beats an absent opponent.
    let result = match present {
        PlayerSlot::One => ResultType::Player2Timeout,
        PlayerSlot::Two => ResultType::Player1Timeout,
    };
    (Some(present), result)
}

// ===== API response DTOs =====

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OpponentInfo {
    pub user_id: Uuid,
    pub wallet: String,
}

/// Poll payload for `GET /api/match/state/:id`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchStateResponse {
    pub match_id: Uuid,
    /// Derived sub-state: funding, waiting_for_ready, waiting_for_go,
    /// countdown, go, completed, cancelled, refunded.
    pub state: String,
    /// Raw lifecycle status.
    pub status: String,
    pub stake_amount: Decimal,
    pub green_light_time: Option<i64>,
    pub green_light_active: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub countdown: Option<i64>,
    pub player_tapped: bool,
    pub opponent_tapped: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub winner_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_type: Option<String>,
    pub server_time: i64,
    pub opponent: OpponentInfo,
    pub state_locked: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub claim_status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub claim_deadline: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cancel_reason: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfirmStakeResponse {
    pub success: bool,
    pub both_staked: bool,
    pub can_start: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadyResponse {
    pub success: bool,
    pub both_ready: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub green_light_time: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub random_delay: Option<i64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TapResponse {
    pub success: bool,
    pub tap: crate::models::tap_event::TapOutcome,
    pub waiting_for_opponent: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disqualified: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TapDetail {
    pub user_id: Uuid,
    pub reaction_ms: i64,
    pub is_valid: bool,
    pub disqualified: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchResultResponse {
    pub match_id: Uuid,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub winner_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_type: Option<String>,
    pub is_winner: bool,
    pub player_reaction_ms: Option<i64>,
    pub opponent_reaction_ms: Option<i64>,
    pub taps: Vec<TapDetail>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub claim_status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub claim_deadline: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub winner_payout: Option<Decimal>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryItem {
    pub match_id: Uuid,
    pub opponent: OpponentInfo,
    pub stake_amount: Decimal,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub winner_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_winner: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub claim_status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub claim_deadline: Option<DateTime<Utc>>,
    pub refund_eligible: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refundable_amount: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cancel_reason: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatResponse {
    pub success: bool,
    pub ping: i64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tx_hash: Option<String>,
    pub amount: Decimal,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RefundResponse {
    pub success: bool,
    pub refund_status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refund_amount: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tx_hash: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tap(reaction_ms: i64, is_valid: bool, disqualified: bool) -> TapSummary {
        TapSummary {
            reaction_ms,
            is_valid,
            disqualified,
        }
    }

    #[test]
    fn test_valid_state_transitions() {
        use MatchStatus::*;

        assert!(Matched.can_transition_to(&Funding));
        assert!(Matched.can_transition_to(&Ready));
        assert!(Matched.can_transition_to(&Cancelled));
        assert!(Funding.can_transition_to(&Ready));
        assert!(Funding.can_transition_to(&Refunded));
        assert!(Ready.can_transition_to(&Started));
        assert!(Started.can_transition_to(&Completed));
        assert!(Started.can_transition_to(&Cancelled));

        assert!(!Matched.can_transition_to(&Started));
        assert!(!Funding.can_transition_to(&Started));
        assert!(!Started.can_transition_to(&Ready));
        assert!(!Completed.can_transition_to(&Cancelled));
        assert!(!Cancelled.can_transition_to(&Matched));
        assert!(!Refunded.can_transition_to(&Ready));
    }

    #[test]
    fn test_terminal_states() {
        assert!(!MatchStatus::Matched.is_terminal());
        assert!(!MatchStatus::Funding.is_terminal());
        assert!(!MatchStatus::Ready.is_terminal());
        assert!(!MatchStatus::Started.is_terminal());
        assert!(MatchStatus::Completed.is_terminal());
        assert!(MatchStatus::Cancelled.is_terminal());
        assert!(MatchStatus::Refunded.is_terminal());
        assert!(MatchStatus::Completed.valid_next_states().is_empty());
    }

    #[test]
    fn test_status_round_trip() {
        for status in [
            MatchStatus::Matched,
            MatchStatus::Funding,
            MatchStatus::Ready,
            MatchStatus::Started,
            MatchStatus::Completed,
            MatchStatus::Cancelled,
            MatchStatus::Refunded,
        ] {
            assert_eq!(MatchStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(MatchStatus::parse("disputed"), None);
    }

    #[test]
    fn outcome_both_disqualified() {
        let (winner, result) = determine_outcome(tap(-1, false, true), tap(-1, false, true), 1);
        assert_eq!(winner, None);
        assert_eq!(result, ResultType::BothDisqualified);
    }

    #[test]
    fn outcome_single_disqualification() {
        let (winner, result) = determine_outcome(tap(-1, false, true), tap(220, true, false), 1);
        assert_eq!(winner, Some(PlayerSlot::Two));
        assert_eq!(result, ResultType::Player1Disqualified);

        let (winner, result) = determine_outcome(tap(220, true, false), tap(-1, false, true), 1);
        assert_eq!(winner, Some(PlayerSlot::One));
        assert_eq!(result, ResultType::Player2Disqualified);
    }

    #[test]
    fn outcome_both_slow() {
        let (winner, result) =
            determine_outcome(tap(3500, false, false), tap(3600, false, false), 1);
        assert_eq!(winner, Some(PlayerSlot::One));
        assert_eq!(result, ResultType::Player1SlowWin);

        let (winner, result) =
            determine_outcome(tap(4000, false, false), tap(3600, false, false), 1);
        assert_eq!(winner, Some(PlayerSlot::Two));
        assert_eq!(result, ResultType::Player2SlowWin);

        let (winner, result) =
            determine_outcome(tap(3500, false, false), tap(3501, false, false), 1);
        assert_eq!(winner, None);
        assert_eq!(result, ResultType::BothTimeoutTie);
    }

    #[test]
    fn outcome_one_slow() {
        let (winner, result) = determine_outcome(tap(3500, false, false), tap(300, true, false), 1);
        assert_eq!(winner, Some(PlayerSlot::Two));
        assert_eq!(result, ResultType::Player1Timeout);

        let (winner, result) = determine_outcome(tap(250, true, false), tap(3200, false, false), 1);
        assert_eq!(winner, Some(PlayerSlot::One));
        assert_eq!(result, ResultType::Player2Timeout);
    }

    #[test]
    fn outcome_normal_win_and_tie() {
        let (winner, result) = determine_outcome(tap(200, true, false), tap(300, true, false), 1);
        assert_eq!(winner, Some(PlayerSlot::One));
        assert_eq!(result, ResultType::NormalWin);

        let (winner, result) = determine_outcome(tap(300, true, false), tap(200, true, false), 1);
        assert_eq!(winner, Some(PlayerSlot::Two));
        assert_eq!(result, ResultType::NormalWin);

        // Delta of exactly the threshold is a tie.
        let (winner, result) = determine_outcome(tap(250, true, false), tap(251, true, false), 1);
        assert_eq!(winner, None);
        assert_eq!(result, ResultType::Tie);
    }

    #[test]
    fn one_sided_valid_tap_wins() {
        let (winner, result) = determine_one_sided_outcome(PlayerSlot::One, tap(240, true, false));
        assert_eq!(winner, Some(PlayerSlot::One));
        assert_eq!(result, ResultType::Player2Timeout);

        let (winner, result) = determine_one_sided_outcome(PlayerSlot::Two, tap(240, true, false));
        assert_eq!(winner, Some(PlayerSlot::Two));
        assert_eq!(result, ResultType::Player1Timeout);
    }

    #[test]
    fn one_sided_disqualified_tap_is_a_tie() {
        let (winner, result) = determine_one_sided_outcome(PlayerSlot::One, tap(-1, false, true));
        assert_eq!(winner, None);
        assert_eq!(result, ResultType::BothTimeoutTie);
    }

    #[test]
    fn correlation_id_is_stable_per_match() {
        let id = Uuid::new_v4();
        let at = Utc::now();
        assert_eq!(correlation_id(id, at), correlation_id(id, at));
        assert!(correlation_id(id, at).contains('-'));
    }
}
