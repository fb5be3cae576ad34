//! Configuration of the engine.
//!
//! The values that are specific to a torrent (piece length, hashes, files)
//! come from [`crate::metainfo::Info`], this file only holds the knobs that
//! apply to every torrent.
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{
    block::{BLOCK_LEN, MAX_BLOCK_LEN},
    error::Error,
};

/// The algorithm that determines which piece is requested next.
///
/// Sequential is useful for streaming, the rarest-first variants keep the
/// swarm healthy by replicating rare pieces first.
#[derive(
    Clone, Copy, Hash, PartialEq, Eq, Default, Debug, Serialize, Deserialize,
)]
#[serde(rename_all = "kebab-case")]
pub enum PieceStrategy {
    /// Pieces in ascending index order.
    Sequential,
    /// Rarest pieces first, ties in a stable order.
    RarestFirst,
    /// Rarest pieces first, ties shuffled so that independent clients do not
    /// all rush for the same piece.
    #[default]
    RandomRarestFirst,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    /// Length of the blocks requested from peers and tracked on disk.
    pub block_len: usize,

    /// How many bytes are read at once when hashing a piece.
    pub verify_step: usize,

    pub piece_strategy: PieceStrategy,

    /// Switch from a sequential start to random rarest-first after this many
    /// verified pieces.
    pub switch_to_rarest_after: Option<usize>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            block_len: BLOCK_LEN,
            verify_step: 4 * BLOCK_LEN,
            piece_strategy: PieceStrategy::default(),
            switch_to_rarest_after: None,
        }
    }
}

impl Config {
    /// Decode a toml string, missing keys fall back to the defaults.
    pub fn from_toml(s: &str) -> Result<Self, Error> {
        let config = toml::from_str::<Config>(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Load the configuration file and transform it into Self.
    ///
    /// # Errors
    ///
    /// Fails if the file cannot be read, is not valid toml, or the values are
    /// out of range.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        let s = tokio::fs::read_to_string(path).await.map_err(|_| {
            Error::FileOpenError(path.to_string_lossy().into_owned())
        })?;
        Self::from_toml(&s)
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.block_len == 0 || self.block_len > MAX_BLOCK_LEN {
            return Err(Error::ConfigInvalid(format!(
                "block_len must be between 1 and {MAX_BLOCK_LEN}, got {}",
                self.block_len
            )));
        }
        if self.verify_step == 0 {
            return Err(Error::ConfigInvalid(
                "verify_step cannot be zero".into(),
            ));
        }
        Ok(())
    }
}
