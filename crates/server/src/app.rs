use std::path::Path;

use anyhow::{Result, anyhow};
use gemma_vlm_config::{AppConfig, LocalFileSystem, ServerSettings};
use gemma_vlm_core::ModelSlot;
use rocket::{Build, Config, Rocket, data::ToByteUnit, tokio};
use tracing::{error, info};

use crate::{
    args::ServerArgs,
    cors::Cors,
    loader::load_runner,
    routes,
    state::{AppState, DynBackend, RequestDefaults, SharedSlot},
};

/// Assembles the rocket instance around an already constructed state.
pub fn build_rocket(state: AppState, server: &ServerSettings) -> Rocket<Build> {
    let figment = Config::figment()
        .merge(("port", server.port))
        .merge(("address", server.host.clone()))
        .merge((
            "limits",
            rocket::data::Limits::default()
                .limit("json", 50.mebibytes())
                .limit("bytes", 50.mebibytes()),
        ));

    rocket::custom(figment)
        .attach(Cors::new(server.cors_origins.clone()))
        .manage(state)
        .mount("/", routes::root_routes())
        .mount("/api", routes::api_routes())
}

/// Loads configuration, loads the model with `open_program` and the
/// configured tokenizer, serves until shutdown and then releases the model.
///
/// A failed startup load is logged and the server keeps running, answering
/// inference requests with 503.
pub async fn serve<F>(args: ServerArgs, open_program: F) -> Result<()>
where
    F: Fn(&Path) -> Result<DynBackend> + Send + Sync + 'static,
{
    crate::logging::init();
    let fs = LocalFileSystem::new("gemma-vlm");
    let (mut app_config, descriptor) = AppConfig::load_or_init(&fs, args.config.as_deref())?;
    app_config += &args;
    app_config.normalise(&fs)?;
    let resources = app_config.model_resources();
    info!(
        "Using configuration {} (model `{}`, program {})",
        descriptor.location.display_with(&fs),
        resources.id,
        resources.program.display_with(&fs),
    );

    let program = resources.program.to_path_buf(&fs);
    let tokenizer = resources.tokenizer.to_path_buf(&fs);
    let prompt = resources.prompt.clone();
    let slot = ModelSlot::new(resources.id.clone(), move || {
        load_runner(&program, &tokenizer, &prompt, &open_program)
    });
    let state = AppState::new(slot, RequestDefaults::from_config(&app_config));
    let shared = state.slot.clone();

    if let Err(err) = with_slot(&shared, |slot| slot.load()).await {
        error!(error = %format!("{err:#}"), "Model failed to load at startup");
    }

    info!(
        "Server ready on {}:{}",
        app_config.server.host, app_config.server.port
    );
    let launched = build_rocket(state, &app_config.server).launch().await;

    with_slot(&shared, |slot| {
        slot.unload();
        Ok(())
    })
    .await?;
    launched.map_err(|err| anyhow!("rocket failed: {err}"))?;
    Ok(())
}

async fn with_slot<T, F>(slot: &SharedSlot, func: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce(&mut ModelSlot<DynBackend>) -> Result<T> + Send + 'static,
{
    let slot = slot.clone();
    tokio::task::spawn_blocking(move || {
        let mut guard = slot.lock().map_err(|_| anyhow!("model lock poisoned"))?;
        func(&mut guard)
    })
    .await
    .map_err(|err| anyhow!("model task failed: {err}"))?
}
