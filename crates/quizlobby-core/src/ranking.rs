//! Standings and completion checks over live player data. Pure functions, no I/O.

use serde::{Deserialize, Serialize};

use crate::ids::UserId;
use crate::member::{LivePlayer, MemberStatus};

/// One row of the final or running standings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RankedPlayer {
    pub id: UserId,
    pub name: String,
    pub score: u32,
    pub progress: u32,
    pub status: MemberStatus,
    /// 1-based position after sorting.
    pub rank: u32,
}

/// Sort by score descending, then progress descending. The sort is stable, so
/// players tied on both keep their input order. Ranks are positions, not
/// dense ranks: two tied players still get distinct ranks.
pub fn rank(players: &[LivePlayer]) -> Vec<RankedPlayer> {
    let mut sorted: Vec<&LivePlayer> = players.iter().collect();
    sorted.sort_by(|a, b| {
        b.progress
            .score
            .cmp(&a.progress.score)
            .then_with(|| b.progress.progress.cmp(&a.progress.progress))
    });
    sorted
        .into_iter()
        .zip(1u32..)
        .map(|(p, rank)| RankedPlayer {
            id: p.id.clone(),
            name: p.name.clone(),
            score: p.progress.score,
            progress: p.progress.progress,
            status: p.status,
            rank,
        })
        .collect()
}

pub fn is_complete(player: &LivePlayer, total_questions: u32) -> bool {
    player.progress.progress >= total_questions
}

/// True when there is at least one player and every player is complete.
pub fn all_complete(players: &[LivePlayer], total_questions: u32) -> bool {
    !players.is_empty() && players.iter().all(|p| is_complete(p, total_questions))
}
