//! Game data cache shared with the client
//!
//! Client and server keep identical 256-entry caches of recently seen input
//! frames so repeated frames can travel as a one-byte key. Entries are
//! replaced in FIFO order, which keeps both sides' keys aligned.

/// Entries per cache; keys fit in one byte
pub const GAME_DATA_CACHE_SIZE: usize = 256;

#[derive(Debug, Clone)]
pub struct GameDataCache {
    entries: Vec<Vec<u8>>,
    next: usize,
}

impl GameDataCache {
    pub fn new() -> Self {
        Self {
            entries: Vec::with_capacity(GAME_DATA_CACHE_SIZE),
            next: 0,
        }
    }

    /// Store a frame; returns its key
    pub fn add(&mut self, data: Vec<u8>) -> u8 {
        let key = if self.entries.len() < GAME_DATA_CACHE_SIZE {
            self.entries.push(data);
            self.entries.len() - 1
        } else {
            self.entries[self.next] = data;
            self.next
        };
        self.next = (key + 1) % GAME_DATA_CACHE_SIZE;
        key as u8
    }

    pub fn get(&self, key: u8) -> Option<&[u8]> {
        self.entries.get(usize::from(key)).map(Vec::as_slice)
    }

    pub fn index_of(&self, data: &[u8]) -> Option<u8> {
        self.entries
            .iter()
            .position(|entry| entry.as_slice() == data)
            .map(|key| key as u8)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.next = 0;
    }
}

impl Default for GameDataCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_and_lookup() {
        let mut cache = GameDataCache::new();
        assert_eq!(cache.add(vec![1, 2]), 0);
        assert_eq!(cache.add(vec![3, 4]), 1);

        assert_eq!(cache.get(1), Some(&[3, 4][..]));
        assert_eq!(cache.index_of(&[1, 2]), Some(0));
        assert_eq!(cache.index_of(&[9]), None);
        assert_eq!(cache.get(2), None);
    }

    #[test]
    fn test_replaces_oldest_when_full() {
        let mut cache = GameDataCache::new();
        for n in 0..GAME_DATA_CACHE_SIZE {
            cache.add(vec![n as u8, 0xAA]);
        }
        assert_eq!(cache.len(), GAME_DATA_CACHE_SIZE);

        assert_eq!(cache.add(vec![0xFF]), 0);
        assert_eq!(cache.add(vec![0xFE]), 1);
        assert_eq!(cache.index_of(&[0, 0xAA]), None);
        assert_eq!(cache.get(2), Some(&[2, 0xAA][..]));
    }

    #[test]
    fn test_clear() {
        let mut cache = GameDataCache::new();
        cache.add(vec![1]);
        cache.clear();
        assert!(cache.is_empty());
        assert_eq!(cache.add(vec![2]), 0);
    }
}
