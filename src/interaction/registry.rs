use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::info;

use crate::interaction::context::Goal;
use crate::interaction::intent::Intent;
use crate::interaction::subtask::{Subtask, SubtaskContributor};
use crate::types::{FriendshipId, UserMessage};

/// Maps a classified intent to the subtasks that fulfil it.
///
/// Contributors register per intent; asking for an intent nobody contributed
/// yields no subtasks, which the refiner treats as an unachievable goal.
pub struct SubtaskRegistry {
    contributors: BTreeMap<Intent, Vec<Arc<dyn SubtaskContributor>>>,
}

impl SubtaskRegistry {
    pub fn new(contributors: Vec<Arc<dyn SubtaskContributor>>) -> Self {
        let mut by_intent: BTreeMap<Intent, Vec<Arc<dyn SubtaskContributor>>> = BTreeMap::new();
        for contributor in contributors {
            by_intent
                .entry(contributor.for_intent())
                .or_default()
                .push(contributor);
        }
        info!(
            intents = by_intent.len(),
            "Subtask registry initialized"
        );
        Self { contributors: by_intent }
    }

    pub fn subtasks_for(
        &self,
        intent: &Intent,
        friendship_id: &FriendshipId,
        message: &UserMessage,
    ) -> Vec<Subtask> {
        self.contributors
            .get(intent)
            .map(|contributors| {
                contributors
                    .iter()
                    .flat_map(|c| c.provide_subtasks(intent, friendship_id, message))
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Decides which goals a set of classified intents amounts to. The default
/// determinator maps each intent to a goal of the same name; domains can
/// register their own to fold several intents into one goal.
pub trait GoalDeterminator: Send + Sync {
    fn can_handle(&self, intents: &[Intent]) -> bool;
    fn determine_goals(&self, intents: &[Intent]) -> Vec<Goal>;
}

pub struct SimpleGoalDeterminator;

impl GoalDeterminator for SimpleGoalDeterminator {
    fn can_handle(&self, _intents: &[Intent]) -> bool {
        true
    }

    fn determine_goals(&self, intents: &[Intent]) -> Vec<Goal> {
        intents.iter().cloned().map(Goal::new).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Channel, MessageId};
    use chrono::Utc;

    struct FixedContributor {
        intent: Intent,
        descriptions: Vec<&'static str>,
    }

    impl SubtaskContributor for FixedContributor {
        fn for_intent(&self) -> Intent {
            self.intent.clone()
        }

        fn provide_subtasks(
            &self,
            intent: &Intent,
            friendship_id: &FriendshipId,
            message: &UserMessage,
        ) -> Vec<Subtask> {
            self.descriptions
                .iter()
                .map(|d| Subtask::for_message(intent.clone(), *d, friendship_id, message))
                .collect()
        }
    }

    fn message() -> UserMessage {
        UserMessage::new(MessageId("m".into()), Utc::now(), "hi", Channel::Signal)
    }

    #[test]
    fn groups_contributors_by_intent() {
        let add = Intent::new("AddTask");
        let registry = SubtaskRegistry::new(vec![
            Arc::new(FixedContributor { intent: add.clone(), descriptions: vec!["store it"] }),
            Arc::new(FixedContributor { intent: add.clone(), descriptions: vec!["confirm it"] }),
        ]);

        let subtasks = registry.subtasks_for(&add, &FriendshipId("f".into()), &message());

        assert_eq!(subtasks.len(), 2);
        assert!(subtasks.iter().all(|s| s.intent == add));
    }

    #[test]
    fn unknown_intent_yields_no_subtasks() {
        let registry = SubtaskRegistry::new(vec![]);
        let subtasks = registry.subtasks_for(
            &Intent::new("AddTask"),
            &FriendshipId("f".into()),
            &message(),
        );
        assert!(subtasks.is_empty());
    }

    #[test]
    fn simple_determinator_maps_each_intent_to_a_goal() {
        let goals = SimpleGoalDeterminator
            .determine_goals(&[Intent::new("AddTask"), Intent::new("SetReminder")]);
        assert_eq!(goals.len(), 2);
        assert_eq!(goals[0].intent, Intent::new("AddTask"));
    }
}
