use std::fmt::Display;

/// Handle of a connected peer inside a [`super::PeerArena`].
///
/// The slot of a disconnected peer is reused by the next peer with a new
/// generation, so a key kept around after a disconnect never reaches the new
/// peer.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, PartialOrd, Ord)]
pub struct PeerKey {
    pub(crate) index: u32,
    pub(crate) generation: u32,
}

impl PeerKey {
    pub(crate) fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }

    /// Pack into a non zero u64, generations start at 1.
    pub(crate) fn to_u64(self) -> u64 {
        ((self.generation as u64) << 32) | self.index as u64
    }

    /// Inverse of [`Self::to_u64`], 0 is no peer.
    pub(crate) fn from_u64(value: u64) -> Option<Self> {
        if value == 0 {
            return None;
        }
        Some(Self { index: value as u32, generation: (value >> 32) as u32 })
    }
}

impl Display for PeerKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}v{}", self.index, self.generation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pack() {
        let key = PeerKey::new(7, 3);
        assert_eq!(PeerKey::from_u64(key.to_u64()), Some(key));
        assert_eq!(PeerKey::from_u64(0), None);
        assert_eq!(key.to_string(), "7v3");

        let key = PeerKey::new(0, 1);
        assert_ne!(key.to_u64(), 0);
    }
}
