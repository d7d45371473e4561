//! Music catalog access.
//!
//! [`CatalogClient`] is the seam the workers crawl through: given an artist
//! id it returns every track in that artist's discography, enriched with
//! audio features and the full profiles of the credited artists.
//! [`SpotifyClient`] implements it against the Spotify Web API.

pub mod client;
pub mod spotify;
pub mod types;

pub use client::{ArtistSubgraph, CatalogClient, CredentialStatus};
pub use spotify::SpotifyClient;
pub use types::{
    AudioFeatures, Followers, FullArtist, FullTrack, Paging, SimpleAlbum, SimpleArtist, SimpleTrack, TrackRecord,
};
