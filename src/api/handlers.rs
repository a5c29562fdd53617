use actix_web::{web, HttpResponse, Responder};
use log::{error, warn};
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};

use crate::blockchain::ledger::SubmitReceipt;
use crate::blockchain::{Account, Address, Block, Ledger, LedgerError, TransactionEnvelope, Wallet};
use crate::sync::{PeerSync, SyncError};

/// Shared ledger handle
pub type LedgerData = web::Data<Ledger>;

/// The node's own identity
pub type IdentityData = web::Data<Wallet>;

/// Peer the node pulls chains from
pub type PeerData = web::Data<PeerSync>;

/// Response for an accepted transaction
#[derive(Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct TransactionResponse {
    /// Always true
    pub success: bool,

    /// Block the transaction was recorded in
    pub block_number: u64,

    /// Block sealed because of this transaction, if any
    pub sealed_block: Option<Block>,
}

/// Response for the chain endpoint
#[derive(Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ChainResponse {
    /// The length of the chain
    pub length: usize,

    /// The blocks in the chain, the open block last
    pub chain: Vec<Block>,

    /// Whether the chain is valid
    pub is_valid: bool,
}

/// Response describing one account
#[derive(Serialize, Deserialize, ToSchema)]
pub struct AccountResponse {
    /// The address of the account
    pub address: Address,

    /// The balance of the account
    pub balance: u64,

    /// The nonce of the account
    pub nonce: u64,
}

impl AccountResponse {
    fn new(address: Address, account: Account) -> Self {
        AccountResponse {
            address,
            balance: account.balance,
            nonce: account.nonce,
        }
    }
}

/// Query for the balance endpoint
#[derive(Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct BalanceQuery {
    /// Address to look up
    pub address: String,
}

/// Request for the node transfer endpoint
#[derive(Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct TransferRequest {
    /// The recipient's address
    pub to_address: String,

    /// The amount to transfer
    pub amount: u64,
}

fn rejection(err: &LedgerError) -> HttpResponse {
    match err {
        LedgerError::Rejected(_)
        | LedgerError::InvalidChain(_)
        | LedgerError::ChainNotLonger { .. } => HttpResponse::BadRequest().json(serde_json::json!({
            "success": false,
            "error": err.to_string()
        })),
        _ => {
            error!("Ledger failure: {}", err);
            HttpResponse::InternalServerError().json(serde_json::json!({
                "success": false,
                "error": err.to_string()
            }))
        }
    }
}

fn blocking_failure(err: actix_web::error::BlockingError) -> HttpResponse {
    error!("Blocking task failed: {}", err);
    HttpResponse::InternalServerError().json(serde_json::json!({
        "success": false,
        "error": "internal error"
    }))
}

/// Runs a ledger call on the blocking pool, mapping failures to responses
async fn run<T, F>(call: F) -> Result<T, HttpResponse>
where
    F: FnOnce() -> Result<T, LedgerError> + Send + 'static,
    T: Send + 'static,
{
    match web::block(call).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err)) => {
            warn!("Ledger call failed: {}", err);
            Err(rejection(&err))
        }
        Err(err) => Err(blocking_failure(err)),
    }
}

fn accepted(receipt: SubmitReceipt) -> HttpResponse {
    HttpResponse::Ok().json(TransactionResponse {
        success: true,
        block_number: receipt.block_number,
        sealed_block: receipt.sealed_block,
    })
}

/// Submit a signed transaction
///
/// Validates the envelope and, if it is accepted, records the transaction in the open block
#[utoipa::path(
    post,
    path = "/api/v1/transaction",
    request_body = TransactionEnvelope,
    responses(
        (status = 200, description = "Transaction accepted", body = TransactionResponse),
        (status = 400, description = "Transaction rejected"),
        (status = 500, description = "Internal server error")
    )
)]
pub async fn submit_transaction(
    ledger: LedgerData,
    envelope: web::Json<TransactionEnvelope>,
) -> impl Responder {
    let envelope = envelope.into_inner();

    match run(move || ledger.submit(envelope)).await {
        Ok(receipt) => accepted(receipt),
        Err(response) => response,
    }
}

/// Get the full chain
///
/// Returns every block, sealed and open, and whether the chain validates
#[utoipa::path(
    get,
    path = "/api/v1/chain",
    responses(
        (status = 200, description = "Chain retrieved successfully", body = ChainResponse),
        (status = 500, description = "Internal server error")
    )
)]
pub async fn get_chain(ledger: LedgerData) -> impl Responder {
    match run(move || ledger.chain_snapshot()).await {
        Ok((chain, is_valid)) => HttpResponse::Ok().json(ChainResponse {
            length: chain.len(),
            chain,
            is_valid,
        }),
        Err(response) => response,
    }
}

/// Offer a chain to replace the local one
///
/// The chain is accepted only if every link and seal re-derives, its
/// transactions replay from genesis, and it is longer than the local chain
#[utoipa::path(
    post,
    path = "/api/v1/chain",
    request_body = Vec<Block>,
    responses(
        (status = 200, description = "Chain replaced"),
        (status = 400, description = "Chain rejected"),
        (status = 500, description = "Internal server error")
    )
)]
pub async fn replace_chain(ledger: LedgerData, blocks: web::Json<Vec<Block>>) -> impl Responder {
    let blocks = blocks.into_inner();
    let length = blocks.len();

    match run(move || ledger.replace_chain(blocks)).await {
        Ok(()) => HttpResponse::Ok().json(serde_json::json!({
            "success": true,
            "length": length
        })),
        Err(response) => response,
    }
}

/// Pull the configured peer's chain
///
/// Adopts the peer's chain under the same rules as a pushed chain
#[utoipa::path(
    post,
    path = "/api/v1/chain/sync",
    responses(
        (status = 200, description = "Chain replaced by the peer's chain"),
        (status = 400, description = "No peer configured or peer chain rejected"),
        (status = 502, description = "Peer unreachable")
    )
)]
pub async fn sync_chain(ledger: LedgerData, peer: PeerData) -> impl Responder {
    match peer.pull(ledger.get_ref().clone()).await {
        Ok(length) => HttpResponse::Ok().json(serde_json::json!({
            "success": true,
            "length": length
        })),
        Err(SyncError::Rejected(err)) => rejection(&err),
        Err(err @ SyncError::NoPeer) => HttpResponse::BadRequest().json(serde_json::json!({
            "success": false,
            "error": err.to_string()
        })),
        Err(err) => {
            warn!("Chain sync failed: {}", err);
            HttpResponse::BadGateway().json(serde_json::json!({
                "success": false,
                "error": err.to_string()
            }))
        }
    }
}

/// Check if the chain is valid
#[utoipa::path(
    get,
    path = "/api/v1/validate",
    responses(
        (status = 200, description = "Chain validation status", body = bool)
    )
)]
pub async fn validate_chain(ledger: LedgerData) -> impl Responder {
    match run(move || ledger.is_valid()).await {
        Ok(is_valid) => HttpResponse::Ok().json(is_valid),
        Err(response) => response,
    }
}

/// Get all accounts
#[utoipa::path(
    get,
    path = "/api/v1/accounts",
    responses(
        (status = 200, description = "Accounts retrieved successfully", body = Vec<AccountResponse>)
    )
)]
pub async fn get_all_accounts(ledger: LedgerData) -> impl Responder {
    match run(move || ledger.accounts()).await {
        Ok(accounts) => {
            let responses: Vec<AccountResponse> = accounts
                .into_iter()
                .map(|(address, account)| AccountResponse::new(address, account))
                .collect();

            HttpResponse::Ok().json(responses)
        }
        Err(response) => response,
    }
}

/// Get one account's balance and nonce
#[utoipa::path(
    get,
    path = "/api/v1/wallet/balance",
    params(BalanceQuery),
    responses(
        (status = 200, description = "Account retrieved successfully", body = AccountResponse),
        (status = 404, description = "Unknown address")
    )
)]
pub async fn get_wallet_balance(
    ledger: LedgerData,
    query: web::Query<BalanceQuery>,
) -> impl Responder {
    let address = Address(query.into_inner().address.trim().to_string());
    let lookup = address.clone();

    match run(move || ledger.account(&lookup)).await {
        Ok(Some(account)) => HttpResponse::Ok().json(AccountResponse::new(address, account)),
        Ok(None) => HttpResponse::NotFound().json(serde_json::json!({
            "error": "Unknown address"
        })),
        Err(response) => response,
    }
}

/// Get the node's own address and account
#[utoipa::path(
    get,
    path = "/api/v1/wallet",
    responses(
        (status = 200, description = "Node wallet", body = AccountResponse)
    )
)]
pub async fn get_node_wallet(ledger: LedgerData, identity: IdentityData) -> impl Responder {
    let address = identity.address().clone();
    let lookup = address.clone();

    match run(move || ledger.account(&lookup)).await {
        Ok(account) => HttpResponse::Ok().json(AccountResponse::new(address, account.unwrap_or_default())),
        Err(response) => response,
    }
}

/// Transfer funds from the node's own account
///
/// The node signs the transaction with its key at its next nonce and submits it
#[utoipa::path(
    post,
    path = "/api/v1/wallet/transfer",
    request_body = TransferRequest,
    responses(
        (status = 200, description = "Transaction accepted", body = TransactionResponse),
        (status = 400, description = "Transaction rejected"),
        (status = 500, description = "Internal server error")
    )
)]
pub async fn transfer_from_node(
    ledger: LedgerData,
    identity: IdentityData,
    transfer_req: web::Json<TransferRequest>,
) -> impl Responder {
    let to_address = match transfer_req.to_address.parse::<Address>() {
        Ok(address) => address,
        Err(err) => {
            return HttpResponse::BadRequest().json(serde_json::json!({
                "success": false,
                "error": format!("Invalid recipient address: {}", err)
            }));
        }
    };
    let amount = transfer_req.amount;

    match run(move || ledger.transfer(identity.get_ref(), to_address, amount)).await {
        Ok(receipt) => accepted(receipt),
        Err(response) => response,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::configure_routes;
    use crate::blockchain::crypto::DEFAULT_KEY_BITS;
    use crate::blockchain::Transaction;
    use crate::config::LedgerConfig;
    use actix_web::{http::StatusCode, test, App};

    struct Node {
        identity: Wallet,
        ledger: Ledger,
    }

    fn node() -> Node {
        let identity = Wallet::generate(DEFAULT_KEY_BITS).unwrap();
        let ledger = Ledger::new(LedgerConfig::default(), &[(identity.address().clone(), 100)]).unwrap();
        Node { identity, ledger }
    }

    macro_rules! app {
        ($node:expr) => {
            test::init_service(
                App::new()
                    .app_data(web::Data::new($node.ledger.clone()))
                    .app_data(web::Data::new($node.identity.clone()))
                    .app_data(web::Data::new(PeerSync::new(None)))
                    .configure(configure_routes),
            )
            .await
        };
    }

    #[actix_web::test]
    async fn test_submit_transaction_endpoint() {
        let node = node();
        let app = app!(node);
        let recipient = Wallet::generate(DEFAULT_KEY_BITS).unwrap();

        let transaction = Transaction::new(
            node.identity.address().clone(),
            recipient.address().clone(),
            30,
            1,
        );
        let envelope = TransactionEnvelope::sign(transaction, &node.identity).unwrap();

        let req = test::TestRequest::post()
            .uri("/api/v1/transaction")
            .set_json(&envelope)
            .to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["success"], true);
        assert_eq!(body["blockNumber"], 0);

        // Replaying the same envelope is rejected
        let req = test::TestRequest::post()
            .uri("/api/v1/transaction")
            .set_json(&envelope)
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let balance = node.ledger.account(recipient.address()).unwrap().unwrap();
        assert_eq!(balance.balance, 30);
    }

    #[actix_web::test]
    async fn test_get_chain_endpoint() {
        let node = node();
        let app = app!(node);

        let req = test::TestRequest::get().uri("/api/v1/chain").to_request();
        let body: ChainResponse = test::call_and_read_body_json(&app, req).await;

        assert_eq!(body.length, 1);
        assert!(body.is_valid);
        assert_eq!(body.chain[0].block_number, 0);
    }

    #[actix_web::test]
    async fn test_transfer_from_node_endpoint() {
        let node = node();
        let app = app!(node);
        let recipient = Wallet::generate(DEFAULT_KEY_BITS).unwrap();

        for _ in 0..2 {
            let req = test::TestRequest::post()
                .uri("/api/v1/wallet/transfer")
                .set_json(&TransferRequest {
                    to_address: recipient.address().0.clone(),
                    amount: 10,
                })
                .to_request();
            let resp = test::call_service(&app, req).await;
            assert_eq!(resp.status(), StatusCode::OK);
        }

        let req = test::TestRequest::get().uri("/api/v1/wallet").to_request();
        let body: AccountResponse = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body.balance, 80);
        assert_eq!(body.nonce, 2);
    }

    #[actix_web::test]
    async fn test_replace_chain_endpoint_rejects_short_chain() {
        let node = node();
        let app = app!(node);

        let req = test::TestRequest::post()
            .uri("/api/v1/chain")
            .set_json(node.ledger.chain().unwrap())
            .to_request();
        let resp = test::call_service(&app, req).await;

        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[actix_web::test]
    async fn test_sync_without_peer_is_bad_request() {
        let node = node();
        let app = app!(node);

        let req = test::TestRequest::post().uri("/api/v1/chain/sync").to_request();
        let resp = test::call_service(&app, req).await;

        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[actix_web::test]
    async fn test_read_endpoints() {
        let node = node();
        let app = app!(node);

        let req = test::TestRequest::get().uri("/api/v1/validate").to_request();
        let is_valid: bool = test::call_and_read_body_json(&app, req).await;
        assert!(is_valid);

        let req = test::TestRequest::get().uri("/api/v1/accounts").to_request();
        let accounts: Vec<AccountResponse> = test::call_and_read_body_json(&app, req).await;
        assert_eq!(accounts.len(), 1);
        assert_eq!(&accounts[0].address, node.identity.address());

        let req = test::TestRequest::get()
            .uri("/api/v1/wallet/balance?address=unknown")
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
