use actix_web::web;

use super::handlers;

/// Configures the API routes
///
/// # Arguments
///
/// * `cfg` - The service configuration
pub fn configure_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api/v1")
            .route("/transaction", web::post().to(handlers::submit_transaction))
            .route("/chain", web::get().to(handlers::get_chain))
            .route("/chain", web::post().to(handlers::replace_chain))
            .route("/chain/sync", web::post().to(handlers::sync_chain))
            .route("/validate", web::get().to(handlers::validate_chain))
            .route("/accounts", web::get().to(handlers::get_all_accounts))
            .route("/wallet", web::get().to(handlers::get_node_wallet))
            .route("/wallet/balance", web::get().to(handlers::get_wallet_balance))
            .route("/wallet/transfer", web::post().to(handlers::transfer_from_node))
    );
}
