// API module
//
// HTTP boundary of the ledger: transaction submission, chain snapshots and
// chain replacement, account queries

pub mod handlers;
pub mod routes;

// Re-export main components for easier access
pub use routes::configure_routes;
