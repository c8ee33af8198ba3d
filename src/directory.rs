//! Process-wide table of parked receivers, keyed by single-use token.
//!
//! A token names exactly one waiting data stream. `take` removes the entry
//! in the same critical section that looks it up, so racing senders (or a
//! sender racing the liveness eviction) can never both win.

use rand::{RngCore, rngs::OsRng};
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::Mutex;

/// Random bytes behind each token (256-bit).
pub const TOKEN_RANDOM_BYTES: usize = 32;

const BASE32_ALPHABET: &[u8; 32] = b"abcdefghijklmnopqrstuvwxyz234567";

pub struct TokenDirectory<T> {
    shard: String,
    entries: Mutex<HashMap<String, T>>,
}

impl<T> TokenDirectory<T> {
    /// `shard` becomes the prefix of every minted token, namespacing relay
    /// processes that share one domain.
    pub fn new(shard: &str) -> Self {
        Self {
            shard: shard.to_lowercase(),
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Mints a fresh `<shard>-<xid>` token. Does not publish anything.
    pub fn generate(&self) -> String {
        let mut random = [0u8; TOKEN_RANDOM_BYTES];
        OsRng.fill_bytes(&mut random);
        format!("{}-{}", self.shard, base32_nopad(&random))
    }

    /// Indexes a data stream under `token`. If the token is already taken
    /// the stream is handed back so the caller can retry under a new token.
    pub fn publish(&self, token: &str, stream: T) -> Result<(), T> {
        let mut entries = self.entries.lock().expect("token directory lock poisoned");
        match entries.entry(token.to_string()) {
            Entry::Occupied(_) => Err(stream),
            Entry::Vacant(slot) => {
                slot.insert(stream);
                Ok(())
            }
        }
    }

    /// Removes and returns the entry for `token`. Lookup and deletion happen
    /// under one lock acquisition; at most one caller ever gets the stream.
    pub fn take(&self, token: &str) -> Option<T> {
        self.entries
            .lock()
            .expect("token directory lock poisoned")
            .remove(token)
    }

    /// Drops the entry if it is still present. Returns whether it was.
    pub fn expire(&self, token: &str) -> bool {
        self.take(token).is_some()
    }

    pub fn contains(&self, token: &str) -> bool {
        self.entries
            .lock()
            .expect("token directory lock poisoned")
            .contains_key(token)
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .expect("token directory lock poisoned")
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn base32_nopad(bytes: &[u8]) -> String {
    let mut result = String::with_capacity(bytes.len().div_ceil(5) * 8);
    let mut bits = 0u32;
    let mut bit_count = 0;

    for &byte in bytes {
        bits = (bits << 8) | byte as u32;
        bit_count += 8;
        while bit_count >= 5 {
            bit_count -= 5;
            result.push(BASE32_ALPHABET[(bits >> bit_count) as usize & 0x1f] as char);
        }
    }
    if bit_count > 0 {
        result.push(BASE32_ALPHABET[(bits << (5 - bit_count)) as usize & 0x1f] as char);
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn base32_known_vectors() {
        assert_eq!(base32_nopad(b""), "");
        assert_eq!(base32_nopad(b"f"), "my");
        assert_eq!(base32_nopad(b"fo"), "mzxq");
        assert_eq!(base32_nopad(b"foo"), "mzxw6");
        assert_eq!(base32_nopad(b"foob"), "mzxw6yq");
        assert_eq!(base32_nopad(b"fooba"), "mzxw6ytb");
        assert_eq!(base32_nopad(b"foobar"), "mzxw6ytboi");
    }

    #[test]
    fn tokens_match_the_observable_format() {
        let directory: TokenDirectory<()> = TokenDirectory::new("01");
        for _ in 0..32 {
            let token = directory.generate();
            let (shard, xid) = token.split_once('-').expect("token has a shard prefix");
            assert_eq!(shard, "01");
            assert_eq!(xid.len(), 52);
            assert!(xid.bytes().all(|b| BASE32_ALPHABET.contains(&b)));
        }
    }

    #[test]
    fn shard_prefix_is_lowercased() {
        let directory: TokenDirectory<()> = TokenDirectory::new("EU1");
        assert!(directory.generate().starts_with("eu1-"));
    }

    #[test]
    fn tokens_are_unique() {
        let directory: TokenDirectory<()> = TokenDirectory::new("01");
        let a = directory.generate();
        let b = directory.generate();
        assert_ne!(a, b);
    }

    #[test]
    fn take_returns_the_published_stream_exactly_once() {
        let directory = TokenDirectory::new("01");
        let token = directory.generate();
        directory.publish(&token, 7usize).unwrap();

        assert_eq!(directory.take(&token), Some(7));
        assert_eq!(directory.take(&token), None);
    }

    #[test]
    fn publish_refuses_a_live_token() {
        let directory = TokenDirectory::new("01");
        let token = directory.generate();
        directory.publish(&token, 1u8).unwrap();

        // The rejected stream comes back to the caller.
        assert_eq!(directory.publish(&token, 2u8), Err(2));
        assert_eq!(directory.take(&token), Some(1));
    }

    #[test]
    fn expire_is_a_noop_for_unknown_tokens() {
        let directory: TokenDirectory<u8> = TokenDirectory::new("01");
        assert!(!directory.expire("01-unknown"));

        let token = directory.generate();
        directory.publish(&token, 9).unwrap();
        assert!(directory.expire(&token));
        assert!(!directory.expire(&token));
        assert!(directory.is_empty());
    }

    #[test]
    fn racing_takes_yield_exactly_one_winner() {
        let directory = Arc::new(TokenDirectory::new("01"));
        let token = directory.generate();
        directory.publish(&token, 42u32).unwrap();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let directory = directory.clone();
                let token = token.clone();
                std::thread::spawn(move || directory.take(&token))
            })
            .collect();

        let wins = handles
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .filter(|taken| *taken == Some(42))
            .count();
        assert_eq!(wins, 1);
        assert!(directory.is_empty());
    }
}
