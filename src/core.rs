use std::sync::Arc;

use tracing::info;

use crate::channels::{SignalChannel, SignalSender};
use crate::config::AppConfig;
use crate::handlers::{reminders, tasks, timers};
use crate::interaction::achiever::GoalAchiever;
use crate::interaction::classifier::IntentClassifier;
use crate::interaction::intent::{IntentContributor, IntentRegistry};
use crate::interaction::orchestrator::ConversationOrchestrator;
use crate::interaction::refiner::GoalRefiner;
use crate::interaction::registry::{GoalDeterminator, SimpleGoalDeterminator, SubtaskRegistry};
use crate::interaction::subtask::{SubtaskContributor, SubtaskHandler};
use crate::providers::OpenAiCompatibleProvider;
use crate::responder::SignalResponder;
use crate::state::SqliteStore;

pub async fn run(config: AppConfig) -> anyhow::Result<()> {
    // 1. State store
    let store = Arc::new(SqliteStore::new(&config.state.db_path).await?);
    info!("State store initialized ({})", config.state.db_path);

    // 2. Provider
    let provider = Arc::new(
        OpenAiCompatibleProvider::new(&config.provider.base_url, &config.provider.api_key)
            .map_err(|e| anyhow::anyhow!(e))?,
    );
    let default_model = config.provider.models.default.clone();
    let precision_model = config.provider.models.precision.clone();
    info!(
        default = %default_model,
        precision = %precision_model,
        "Provider configured ({})",
        config.provider.base_url
    );

    // 3. Domain contributors and handlers
    let mut intent_contributors: Vec<Box<dyn IntentContributor>> = Vec::new();
    intent_contributors.extend(tasks::intent_contributors());
    intent_contributors.extend(reminders::intent_contributors());
    intent_contributors.extend(timers::intent_contributors());

    let mut subtask_contributors: Vec<Arc<dyn SubtaskContributor>> = Vec::new();
    subtask_contributors.extend(tasks::subtask_contributors());
    subtask_contributors.extend(reminders::subtask_contributors());
    subtask_contributors.extend(timers::subtask_contributors());

    let mut subtask_handlers: Vec<Arc<dyn SubtaskHandler>> = Vec::new();
    subtask_handlers.extend(tasks::subtask_handlers(
        provider.clone(),
        store.clone(),
        store.clone(),
        &default_model,
    ));
    subtask_handlers.extend(reminders::subtask_handlers(
        provider.clone(),
        store.clone(),
        store.clone(),
        &default_model,
    ));
    subtask_handlers.extend(timers::subtask_handlers(
        provider.clone(),
        store.clone(),
        store.clone(),
        &default_model,
    ));

    // 4. Registries
    let intent_registry = Arc::new(IntentRegistry::new(&intent_contributors));
    let subtask_registry = Arc::new(SubtaskRegistry::new(subtask_contributors));
    let goal_determinators: Vec<Arc<dyn GoalDeterminator>> = vec![Arc::new(SimpleGoalDeterminator)];

    // 5. Interaction pipeline
    let classifier = Arc::new(IntentClassifier::new(
        provider.clone(),
        intent_registry.clone(),
        default_model.clone(),
        precision_model.clone(),
        tasks::TaskIntents::add(),
    ));
    let refiner = Arc::new(GoalRefiner::new(
        provider.clone(),
        store.clone(),
        subtask_registry,
        intent_registry,
        goal_determinators,
        default_model.clone(),
    ));
    let achiever = Arc::new(GoalAchiever::new(
        subtask_handlers,
        provider.clone(),
        store.clone(),
        precision_model,
    ));

    // 6. Outgoing messages
    let sender = Arc::new(SignalSender::new(&config.signal.api_url)?);
    let responder = Arc::new(SignalResponder::new(
        provider,
        sender.clone(),
        store.clone(),
        store.clone(),
        &default_model,
    ));

    // 7. Orchestrator
    let orchestrator = Arc::new(ConversationOrchestrator::new(
        classifier,
        refiner,
        achiever,
        store.clone(),
        store,
        responder,
    ));

    // 8. Signal receive loop
    let channel = Arc::new(SignalChannel::new(
        &config.signal.api_url,
        sender,
        orchestrator,
    ));
    info!("Starting Signal channel ({})", config.signal.api_url);
    channel.run().await;

    Ok(())
}
