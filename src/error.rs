use thiserror::Error;

/// Errors reported by the routing table, the lookup and message dispatch.
///
/// None of these are fatal to a running node. Peer-query and probe failures
/// are not represented here at all: they only shrink the information a lookup
/// or an eviction works with.
#[derive(Debug, Error)]
pub enum DhtError {
    #[error("cannot add the local node to its own routing table")]
    SelfContact,

    #[error("invalid contact: {0}")]
    InvalidContact(String),

    #[error("bucket {index} is full and its least recently seen contact is alive")]
    BucketFull { index: usize },

    #[error("cannot send a message to the local node")]
    InvalidTarget,

    #[error("peer not found: {0}")]
    PeerNotFound(String),

    #[error("message is addressed to another node")]
    MisroutedMessage,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("network error: {0}")]
    Network(#[from] anyhow::Error),
}
