//! Main Entrypoint for the Chorus API Service
//!
//! This binary is responsible for:
//! 1. Loading configuration from the environment.
//! 2. Building the agents and their model/speech collaborators.
//! 3. Wiring bus, orchestrator, audio sequencer and gateway together.
//! 4. Constructing the Axum router and applying middleware.
//! 5. Starting the web server and handling graceful shutdown.

use anyhow::Context;
use async_openai::config::OpenAIConfig;
use chorus_api::{config::Config, player::SpeakerSink, router::create_router, state::AppState};
use chorus_core::{
    AudioSequencer, CommandBus, Orchestrator, StreamGateway,
    agents::{AgentRegistry, CalendarAgent, GeneralAgent, WeatherAgent},
    llm_client::{InferenceClient, OpenAICompatibleClient},
    routing::KeywordRoutingPolicy,
    speech::{MutedSynthesizer, OpenAISpeechSynthesizer, SpeechSynthesizer},
    tools::demo_registry,
};
use std::{net::SocketAddr, sync::Arc};
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, filter::LevelFilter};

/// Listens for the `Ctrl+C` signal to gracefully shut down the server.
async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to install Ctrl+C handler");
        std::future::pending::<()>().await;
    }
    info!("Received shutdown signal. Shutting down gracefully...");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // --- 1. Load Configuration ---
    let config = Config::from_env().context("Failed to load configuration")?;

    // --- 2. Initialize Logging ---
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::from_level(config.log_level).into())
        .from_env_lossy();
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
        .init();
    info!("Configuration loaded. Initializing engine...");

    // --- 3. Model and speech collaborators ---
    let openai_config = OpenAIConfig::new()
        .with_api_key(&config.openai_api_key)
        .with_api_base(&config.llm_api_base);
    let llm: Arc<dyn InferenceClient> = Arc::new(OpenAICompatibleClient::new(
        openai_config.clone(),
        config.chat_model.clone(),
    ));
    let speech: Arc<dyn SpeechSynthesizer> = if config.speech_enabled {
        Arc::new(OpenAISpeechSynthesizer::new(
            openai_config,
            config.tts_model.clone(),
            &config.tts_voice,
        ))
    } else {
        info!("Speech disabled; agents will run silent.");
        Arc::new(MutedSynthesizer)
    };

    // --- 4. Agents ---
    let tools = Arc::new(demo_registry());
    let agents = AgentRegistry::builder(Arc::new(GeneralAgent::new(llm, tools.clone())))
        .specialist(Arc::new(WeatherAgent::new(tools.clone())))
        .specialist(Arc::new(CalendarAgent::new(tools)))
        .build()
        .context("Failed to build agent registry")?;

    // --- 5. Engine ---
    let bus = Arc::new(CommandBus::new(config.bus()));
    let orchestrator = Orchestrator::builder(bus.clone(), Arc::new(agents))
        .routing(Arc::new(KeywordRoutingPolicy {
            chain_enabled: config.chain_routing,
        }))
        .speech(speech)
        .config(config.orchestrator())
        .build();

    let speaker = Arc::new(SpeakerSink::new(config.player_sample_rate));
    let sequencer = Arc::new(
        AudioSequencer::new(bus, speaker.clone(), config.sequencer()).spawn(),
    );

    let app_state = Arc::new(AppState {
        gateway: StreamGateway::new(orchestrator),
        speaker,
        sequencer: sequencer.clone(),
    });

    // --- 6. Create Router and Apply Middleware ---
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = create_router(app_state).layer(cors);

    // --- 7. Start Server ---
    info!(
        model = %config.chat_model,
        speech = config.speech_enabled,
        bind_address = %config.bind_address,
        "Service configured. Starting server..."
    );
    let listener = tokio::net::TcpListener::bind(config.bind_address).await?;

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    sequencer.abort();
    info!("Server has shut down.");
    Ok(())
}
