use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::info;

/// A named category of user purpose. Pure name-equality value object: two
/// intents with the same name are interchangeable, and there is no hierarchy.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Intent(pub String);

impl Intent {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn name(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Intent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Intents the core itself understands, independent of any domain handler.
pub struct CoreIntents;

impl CoreIntents {
    pub fn smalltalk() -> Intent {
        Intent::new("Smalltalk")
    }

    pub fn cancel_goal() -> Intent {
        Intent::new("CancelGoal")
    }

    pub fn unknown() -> Intent {
        Intent::new("Unknown")
    }

    pub fn follow_up() -> Intent {
        Intent::new("FollowUp")
    }
}

/// Registers one intent with the description the classifier prompt shows.
pub trait IntentContributor: Send + Sync {
    fn intent(&self) -> Intent;
    fn description(&self) -> String;
}

/// All intents the system knows about. Built once at startup from the static
/// core set plus the registered contributors; immutable afterwards.
pub struct IntentRegistry {
    all: BTreeMap<Intent, String>,
}

impl IntentRegistry {
    pub fn new(contributors: &[Box<dyn IntentContributor>]) -> Self {
        let mut all = BTreeMap::new();
        all.insert(
            CoreIntents::smalltalk(),
            "Small casual conversations".to_string(),
        );
        all.insert(
            CoreIntents::cancel_goal(),
            "Cancel *currently ongoing or just initiated* task (e.g., user changes their mind before completing an action)"
                .to_string(),
        );
        all.insert(CoreIntents::follow_up(), "Answer to a question".to_string());
        all.insert(
            CoreIntents::unknown(),
            "Could not classify the intent".to_string(),
        );
        for contributor in contributors {
            all.insert(contributor.intent(), contributor.description());
        }
        info!(
            intents = %all.keys().map(Intent::name).collect::<Vec<_>>().join(", "),
            "Loaded intents"
        );
        Self { all }
    }

    pub fn get_all(&self) -> Vec<Intent> {
        self.all.keys().cloned().collect()
    }

    pub fn get_descriptions(&self) -> &BTreeMap<Intent, String> {
        &self.all
    }

    pub fn contains(&self, intent: &Intent) -> bool {
        self.all.contains_key(intent)
    }

    /// Look an intent up by name, falling back to `Unknown` for names the
    /// model invented.
    pub fn resolve(&self, name: &str) -> Intent {
        let candidate = Intent::new(name);
        if self.all.contains_key(&candidate) {
            candidate
        } else {
            CoreIntents::unknown()
        }
    }
}
