//! The catalog client seam.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;

use super::types::TrackRecord;
use crate::error::FetchError;

/// Everything fetched for one artist.
#[derive(Debug, Clone, Default)]
pub struct ArtistSubgraph {
    /// Every track on the artist's albums, singles and compilations.
    pub tracks: Vec<TrackRecord>,
    /// Upstream requests spent producing `tracks`.
    pub requests_used: u64,
}

/// A catalog client bound to one credential.
///
/// Pagination, authentication and upstream retries are the client's
/// business. When the credential's rate-limit budget is spent the client
/// returns `FetchError::Exhausted`.
#[async_trait]
pub trait CatalogClient: Send + Sync {
    /// Name of the credential, used to label the bound worker.
    fn name(&self) -> &str;

    async fn fetch_artist_subgraph(&self, artist_id: &str) -> Result<ArtistSubgraph, FetchError>;
}

/// Health of a credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialStatus {
    Available,
    /// Rate limited; usable again after `cooldown`.
    Cold { cooldown: Duration },
}

impl fmt::Display for CredentialStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Available => f.write_str("available"),
            Self::Cold { cooldown } => write!(f, "cold ({}s cooldown)", cooldown.as_secs()),
        }
    }
}
