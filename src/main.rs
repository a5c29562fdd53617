use actix_cors::Cors;
use actix_web::{middleware, web, App, HttpServer};
use anyhow::Context;
use clap::Parser;
use log::{info, warn};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

mod api;
mod blockchain;
mod config;
mod sync;

use config::NodeConfig;
use sync::PeerSync;

// Load the node's key pair, generating one on first start
fn load_identity(config: &NodeConfig) -> anyhow::Result<blockchain::Wallet> {
    blockchain::Wallet::load_or_generate(&config.key_path, config.key_bits)
        .with_context(|| format!("failed to load key from {}", config.key_path.display()))
}

// Open the ledger, crediting the node's own address at genesis
fn initialize_ledger(
    config: &NodeConfig,
    identity: &blockchain::Wallet,
) -> anyhow::Result<blockchain::Ledger> {
    let ledger_config = config.ledger_config();
    let genesis = [(identity.address().clone(), config.initial_balance)];

    if config.in_memory {
        info!("Creating in-memory ledger");
        return Ok(blockchain::Ledger::new(ledger_config, &genesis)?);
    }

    // Create data directory if it doesn't exist
    std::fs::create_dir_all(&config.data_dir).unwrap_or_else(|e| {
        warn!("Failed to create data directory: {}", e);
    });

    match blockchain::Ledger::with_storage(ledger_config, &genesis, &config.data_dir) {
        Ok(ledger) => {
            info!("Loaded ledger from storage at {}", config.data_dir.display());
            Ok(ledger)
        }
        Err(err) => {
            warn!("Failed to load ledger from storage: {}", err);
            warn!("Creating in-memory ledger instead");
            Ok(blockchain::Ledger::new(ledger_config, &genesis)?)
        }
    }
}

#[derive(OpenApi)]
#[openapi(
    paths(
        api::handlers::submit_transaction,
        api::handlers::get_chain,
        api::handlers::replace_chain,
        api::handlers::sync_chain,
        api::handlers::validate_chain,
        api::handlers::get_all_accounts,
        api::handlers::get_wallet_balance,
        api::handlers::get_node_wallet,
        api::handlers::transfer_from_node
    ),
    components(
        schemas(
            blockchain::Block,
            blockchain::Transaction,
            blockchain::TransactionEnvelope,
            blockchain::Address,
            blockchain::AuthTag,
            api::handlers::TransactionResponse,
            api::handlers::ChainResponse,
            api::handlers::AccountResponse,
            api::handlers::TransferRequest
        )
    ),
    tags(
        (name = "ledger", description = "Ledger API endpoints")
    ),
    info(
        title = "Ledger API",
        version = "0.1.0",
        description = "Single-node ledger with RSA-authenticated transactions and proof of work",
        license(
            name = "MIT",
            url = "https://opensource.org/licenses/MIT"
        )
    )
)]
struct ApiDoc;

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logger
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    let config = NodeConfig::parse();

    let identity = load_identity(&config)?;
    info!("Node address: {}", identity.address());

    let ledger = web::Data::new(initialize_ledger(&config, &identity)?);
    let identity = web::Data::new(identity);
    let peer = web::Data::new(PeerSync::new(config.peer.clone()));

    if let Some(url) = peer.peer() {
        info!("Pulling chain from peer {}", url);
        if let Err(err) = peer.pull(ledger.get_ref().clone()).await {
            warn!("Initial sync with {} failed: {}", url, err);
        }
    }

    info!(
        "Difficulty {}, blocks sealed after {} transactions",
        ledger.difficulty(),
        ledger.block_threshold()
    );
    info!("Starting HTTP server at http://{}:{}", config.bind, config.port);

    // Start HTTP server
    HttpServer::new(move || {
        // Configure CORS
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        // Configure OpenAPI documentation
        let openapi = ApiDoc::openapi();

        App::new()
            .wrap(middleware::Logger::default())
            .wrap(cors)
            .app_data(ledger.clone())
            .app_data(identity.clone())
            .app_data(peer.clone())
            // API routes
            .configure(api::configure_routes)
            // Swagger UI
            .service(
                SwaggerUi::new("/swagger-ui/{_:.*}")
                    .url("/api-docs/openapi.json", openapi.clone())
            )
    })
    .bind((config.bind.as_str(), config.port))?
    .run()
    .await?;

    Ok(())
}
