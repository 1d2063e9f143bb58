use std::{fs, sync::Arc};

use teloxide::{
    dptree::deps, payloads::SetMyCommandsSetters, prelude::*, types::AllowedUpdate,
    update_listeners::Polling,
};

use crate::{
    actions::TelegramClient,
    config::Config,
    database::{restore_states, save_spinloop, save_states, Database},
    handlers::{bot_command_scope, generate_bot_commands, handle_message, BotPipeline},
    pipeline::Moderator,
    state::{sweep_spinloop, StateStore},
};

/// Read the bot token from the `TOKEN` environment variable, or from the key file.
fn load_token() -> String {
    if let Ok(token) = std::env::var("TOKEN") {
        return token;
    }

    fs::read_to_string(match cfg!(debug_assertions) {
        true => "key_debug",
        false => "key",
    })
    .expect("Could not load bot key file!")
    .trim()
    .to_string()
}

/// # Panics
///
/// Panics if there's no bot token, or the config or the database are broken.
pub async fn entry() {
    let config_path =
        std::env::var("ANTISPAM_CONFIG").unwrap_or_else(|_| "antispam.toml".to_string());
    let mut config = Config::load(&config_path).expect("Could not load the config!");
    if let Ok(path) = std::env::var("DATA_PATH") {
        config.database_path = path;
    }
    let config = Arc::new(config);

    let bot = Bot::new(load_token());

    bot.set_my_commands(generate_bot_commands())
        .scope(bot_command_scope())
        .await
        .expect("Failed to set bot commands!");

    let database: Arc<Database> = Database::new(&config.database_path)
        .await
        .expect("Failed to create database!");

    let store = Arc::new(StateStore::new(config.clone()));
    restore_states(&database, &store)
        .await
        .expect("Failed to restore moderation state!");

    tokio::spawn(save_spinloop(
        Arc::downgrade(&database),
        Arc::downgrade(&store),
        config.state.save_interval(),
        config.state.ttl(),
    ));
    tokio::spawn(sweep_spinloop(
        Arc::downgrade(&store),
        config.state.sweep_interval(),
    ));

    let client = Arc::new(TelegramClient::new(bot.clone(), database.clone()));
    let moderator = Moderator::new(config.clone(), store.clone(), client, database.word_list());
    let pipeline: BotPipeline = BotPipeline::new(moderator, &config.pipeline);

    log::info!("Creating the handler...");

    let handler = dptree::entry().branch(Update::filter_message().endpoint(handle_message));

    let listener = Polling::builder(bot.clone())
        .allowed_updates(vec![AllowedUpdate::Message])
        .build();

    let mut dispatcher = Dispatcher::builder(bot, handler)
        .default_handler(|_| async {})
        .dependencies(deps![pipeline.clone(), database.clone()])
        .build();

    let shutdown_token = dispatcher.shutdown_token();
    tokio::spawn(async move {
        bot_commons::shutdown_signal().await;
        match shutdown_token.shutdown() {
            Ok(done) => done.await,
            Err(e) => log::warn!("Dispatcher was not running: {e}"),
        }
    });

    log::info!("Dispatching the dispatcher!");

    dispatcher
        .dispatch_with_listener(
            listener,
            LoggingErrorHandler::with_custom_text("An error from the update listener"),
        )
        .await;

    log::info!("it appears we have been bonked.");

    pipeline.shutdown(config.pipeline.shutdown_grace()).await;

    if let Err(e) = save_states(&database, &store, config.state.ttl()).await {
        log::error!("Failed to save moderation state on shutdown: {e:?}");
    }
}
