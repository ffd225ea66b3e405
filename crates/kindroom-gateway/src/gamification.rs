//! Experience and mood rules. Pure functions, no I/O.

use kindroom_types::models::{Mood, User};
use kindroom_types::moderation::Verdict;

pub const HARMFUL_XP_PENALTY: i64 = 10;
pub const CLEAN_XP_REWARD: i64 = 5;
pub const DEFAULT_HARMFUL_THRESHOLD: i64 = 10;

/// The part of a user that one message can change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UserState {
    pub experience_points: i64,
    pub mood: Mood,
    pub harmful_count: i64,
}

impl From<&User> for UserState {
    fn from(user: &User) -> Self {
        Self {
            experience_points: user.experience_points,
            mood: user.mood,
            harmful_count: user.harmful_count,
        }
    }
}

/// Snapshot stamped onto the stored message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Annotation {
    pub mood: Mood,
    pub experience_points: i64,
    pub harmful: bool,
}

pub fn apply(state: &UserState, verdict: &Verdict) -> (UserState, Annotation) {
    let current = state.experience_points.max(0);

    let next = if verdict.harmful {
        UserState {
            experience_points: current.saturating_sub(HARMFUL_XP_PENALTY).max(0),
            mood: Mood::Crying,
            harmful_count: state.harmful_count.saturating_add(1),
        }
    } else {
        UserState {
            experience_points: current.saturating_add(CLEAN_XP_REWARD),
            mood: Mood::Smiling,
            harmful_count: state.harmful_count,
        }
    };

    let annotation = Annotation {
        mood: next.mood,
        experience_points: next.experience_points,
        harmful: verdict.harmful,
    };

    (next, annotation)
}

/// Whether a message warrants the quiz/report escalation. Evaluated on the
/// state *after* [`apply`].
pub fn crosses_threshold(state: &UserState, harmful: bool, threshold: i64) -> bool {
    harmful && state.harmful_count >= threshold
}
