use snafu::ensure;

use super::error::{InvalidContentSnafu, StoreResult};
use super::ids::UserId;
use super::types::{Reaction, ReactionCount, ReactionEvent};

/// Longest accepted emoji sequence, in characters (covers ZWJ sequences).
pub const MAX_EMOJI_LEN: usize = 16;

pub fn validate_emoji(emoji: &str) -> StoreResult<()> {
    let trimmed = emoji.trim();
    ensure!(
        !trimmed.is_empty(),
        InvalidContentSnafu {
            stage: "validate-emoji",
            details: "emoji is empty".to_string(),
        }
    );
    ensure!(
        trimmed.chars().count() <= MAX_EMOJI_LEN,
        InvalidContentSnafu {
            stage: "validate-emoji",
            details: format!("emoji '{trimmed}' is too long"),
        }
    );
    Ok(())
}

/// Folds one add/remove event into a reaction list.
///
/// A user holds at most one reaction per message: adding replaces the previous
/// emoji in place, removing drops it. Events addressed to another message leave
/// the list untouched.
pub fn fold(reactions: &[Reaction], event: &ReactionEvent) -> Vec<Reaction> {
    match event {
        ReactionEvent::Add(added) => {
            let mut next = Vec::with_capacity(reactions.len() + 1);
            let mut replaced = false;
            for existing in reactions {
                if existing.message_id != added.message_id {
                    next.push(existing.clone());
                } else if existing.user_id == added.user_id {
                    // Keep the first slot so replacing an emoji does not reorder the row.
                    if !replaced {
                        next.push(added.clone());
                        replaced = true;
                    }
                } else {
                    next.push(existing.clone());
                }
            }
            if !replaced {
                next.push(added.clone());
            }
            next
        }
        ReactionEvent::Remove {
            message_id,
            user_id,
            emoji,
        } => reactions
            .iter()
            .filter(|existing| {
                let targeted = &existing.message_id == message_id && &existing.user_id == user_id;
                let emoji_matches = emoji
                    .as_deref()
                    .is_none_or(|withdrawn| withdrawn == existing.emoji);
                !(targeted && emoji_matches)
            })
            .cloned()
            .collect(),
    }
}

/// Per-emoji counts in order of first appearance.
pub fn summarize(reactions: &[Reaction], local_user: &UserId) -> Vec<ReactionCount> {
    let mut counts: Vec<ReactionCount> = Vec::new();
    for reaction in reactions {
        let mine = &reaction.user_id == local_user;
        match counts.iter_mut().find(|count| count.emoji == reaction.emoji) {
            Some(count) => {
                count.count += 1;
                count.reacted_by_me |= mine;
            }
            None => counts.push(ReactionCount {
                emoji: reaction.emoji.clone(),
                count: 1,
                reacted_by_me: mine,
            }),
        }
    }
    counts
}
