use std::hash::{Hash, Hasher};

use crate::models::CacheKey;

pub trait DigestHasher {
    fn input<I: Hash>(&mut self, input: I);
}

impl DigestHasher for blake3::Hasher {
    fn input<I: Hash>(&mut self, input: I) {
        struct StdHasher<'a>(&'a mut blake3::Hasher);

        impl<'a> Hasher for StdHasher<'a> {
            fn finish(&self) -> u64 {
                unreachable!("a digest is read through blake3::Hasher::finalize");
            }

            fn write(&mut self, bytes: &[u8]) {
                self.0.update(bytes);
            }
        }

        input.hash(&mut StdHasher(self))
    }
}

/// Hex digest of anything hashable, used for container spec labels.
pub fn digest<I: Hash>(input: I) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.input(input);
    hasher.finalize().to_hex().to_string()
}

/// The key of a fetch: changes whenever the source or the tag changes.
pub fn cache_key(source_url: &str, tag: &str) -> CacheKey {
    CacheKey(digest((source_url, tag)))
}
