use actix_web::web;
use log::info;
use thiserror::Error;

use crate::api::handlers::ChainResponse;
use crate::blockchain::{Ledger, LedgerError};

/// Errors that can occur while pulling a chain from a peer
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("No peer configured")]
    NoPeer,

    #[error("Request to peer failed: {0}")]
    RequestError(#[from] reqwest::Error),

    #[error("Peer chain rejected: {0}")]
    Rejected(#[from] LedgerError),

    #[error("Blocking task failed: {0}")]
    BlockingError(String),
}

/// Pulls chains from another node's `/api/v1/chain` endpoint
#[derive(Debug, Clone)]
pub struct PeerSync {
    peer: Option<String>,
    client: reqwest::Client,
}

impl PeerSync {
    pub fn new(peer: Option<String>) -> Self {
        PeerSync {
            peer: peer.map(|url| url.trim_end_matches('/').to_string()),
            client: reqwest::Client::new(),
        }
    }

    pub fn peer(&self) -> Option<&str> {
        self.peer.as_deref()
    }

    /// Fetches the peer's chain and hands it to [`Ledger::replace_chain`].
    ///
    /// Returns the length of the adopted chain.
    pub async fn pull(&self, ledger: Ledger) -> Result<usize, SyncError> {
        let peer = self.peer.as_deref().ok_or(SyncError::NoPeer)?;
        let url = format!("{}/api/v1/chain", peer);

        let response: ChainResponse = self
            .client
            .get(&url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let length = response.chain.len();
        info!("Fetched chain of {} blocks from {}", length, peer);

        web::block(move || ledger.replace_chain(response.chain))
            .await
            .map_err(|e| SyncError::BlockingError(e.to_string()))??;

        info!("Adopted chain of {} blocks from {}", length, peer);
        Ok(length)
    }
}
