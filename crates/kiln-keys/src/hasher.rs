//! The canonical key serializer.
//!
//! Every value fed into the sponge carries a leading type tag, and
//! variable-width values carry a length prefix, so no two distinct input
//! sequences can collide by concatenation.

use kiln_hash::{Digest, RuleKey};

const TAG_STR: u8 = 0x01;
const TAG_U64: u8 = 0x02;
const TAG_BOOL: u8 = 0x03;
const TAG_SEQ: u8 = 0x04;
const TAG_SET: u8 = 0x05;
const TAG_PATH: u8 = 0x06;
const TAG_DIGEST: u8 = 0x07;
const TAG_FIELD: u8 = 0x08;

/// Hash sponge with canonical value framing.
pub struct KeyHasher {
    inner: blake3::Hasher,
}

impl KeyHasher {
    pub fn new() -> Self {
        Self {
            inner: blake3::Hasher::new(),
        }
    }

    fn tag(&mut self, t: u8) {
        self.inner.update(&[t]);
    }

    fn len(&mut self, n: usize) {
        self.inner.update(&(n as u64).to_le_bytes());
    }

    /// Frame the start of a named field.
    pub fn put_field(&mut self, name: &str) {
        self.tag(TAG_FIELD);
        self.len(name.len());
        self.inner.update(name.as_bytes());
    }

    pub fn put_str(&mut self, value: &str) {
        self.tag(TAG_STR);
        self.len(value.len());
        self.inner.update(value.as_bytes());
    }

    pub fn put_u64(&mut self, value: u64) {
        self.tag(TAG_U64);
        self.inner.update(&value.to_le_bytes());
    }

    pub fn put_bool(&mut self, value: bool) {
        self.tag(TAG_BOOL);
        self.inner.update(&[value as u8]);
    }

    /// A path fed by name only (no content).
    pub fn put_path(&mut self, path: &str) {
        self.tag(TAG_PATH);
        self.len(path.len());
        self.inner.update(path.as_bytes());
    }

    pub fn put_digest(&mut self, digest: &Digest) {
        self.tag(TAG_DIGEST);
        self.inner.update(&digest.0);
    }

    /// Ordered collection: element order is significant.
    pub fn put_str_seq(&mut self, values: &[String]) {
        self.tag(TAG_SEQ);
        self.len(values.len());
        for v in values {
            self.put_str(v);
        }
    }

    /// Unordered collection: each element is hashed to a sub-digest and the
    /// sorted sub-digests are fed, so iteration order never matters.
    pub fn put_str_set(&mut self, values: &[String]) {
        let mut digests: Vec<Digest> = values
            .iter()
            .map(|v| Digest::from_bytes(v.as_bytes()))
            .collect();
        digests.sort();
        self.tag(TAG_SET);
        self.len(digests.len());
        for d in digests {
            self.put_digest(&d);
        }
    }

    /// Unordered collection of digests.
    pub fn put_digest_set(&mut self, digests: &[Digest]) {
        let mut sorted = digests.to_vec();
        sorted.sort();
        self.tag(TAG_SET);
        self.len(sorted.len());
        for d in sorted {
            self.put_digest(&d);
        }
    }

    pub fn finish(self) -> RuleKey {
        Digest::from_blake3(self.inner.finalize())
    }
}

impl Default for KeyHasher {
    fn default() -> Self {
        Self::new()
    }
}
