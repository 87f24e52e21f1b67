use crate::error::{Error, Result};

use hmac::{Hmac, Mac};
use secp256k1::{PublicKey, Scalar, SecretKey, SECP256K1};
use sha2::{Digest, Sha512};

type HmacSha512 = Hmac<Sha512>;

/// A hierarchical deterministic key over secp256k1. Every key carries a
/// 32-byte chaincode and either a secret key (a spending key, from which
/// the public key is computed on demand) or just an encoded public key (a
/// watch-only key). Deriving a child at an index is deterministic, so a
/// spending chain and the watch-only chain obtained by neutering it yield
/// the same public keys at every step.
///
/// Derivation computes `m = HMAC-SHA512(key = chaincode, msg =
/// encoded_pubkey ‖ index)` with the index as 4 big-endian bytes. The
/// child chaincode is `m[32..64]`, and `L = m[0..32]` as a big-endian
/// scalar multiplies the parent key: a secret `d` becomes `d·L mod n`,
/// and a public point `P` becomes `L·P`. There is no hardened derivation,
/// and the scheme predates BIP-32: outputs are not interchangeable with
/// BIP-32 wallets and must stay bit-exact.
///
/// Public keys are SEC1-encoded, compressed (33 bytes) or uncompressed
/// (65 bytes) per the key's compression flag, which children inherit.
/// Since the encoded public key feeds the derivation HMAC, the flag
/// changes which children a chain produces, not just their encoding.
#[derive(Clone, Debug)]
pub struct HdKey {
    /// The 32-byte chaincode mixed into child derivation.
    chaincode: [u8; 32],
    /// Whether public keys use the compressed SEC1 encoding.
    compressed: bool,
    /// The secret key, absent for watch-only keys.
    secret: Option<SecretKey>,
    /// The SEC1-encoded public key, computed lazily from the secret.
    public: Option<Vec<u8>>,
}

impl HdKey {
    /// Derives a master spending key from a seed: the seed's SHA-512
    /// digest splits into the secret key (first 32 bytes) and the
    /// chaincode (last 32 bytes). The public key is left to be computed
    /// on demand.
    pub fn from_seed(seed: &[u8], compressed: bool) -> Result<Self> {
        let digest = Sha512::digest(seed);
        let secret = SecretKey::from_slice(&digest[..32])?;
        let mut chaincode = [0u8; 32];
        chaincode.copy_from_slice(&digest[32..]);
        Ok(Self { chaincode, compressed, secret: Some(secret), public: None })
    }

    /// Builds a watch-only key from a chaincode and a SEC1-encoded public
    /// key. The compression flag is inferred from the encoding length.
    pub fn from_public(chaincode: [u8; 32], public: Vec<u8>) -> Self {
        let compressed = public.len() < 65;
        Self { chaincode, compressed, secret: None, public: Some(public) }
    }

    /// Builds a spending key from a chaincode and secret key bytes, with
    /// an optionally precomputed encoded public key.
    pub fn from_secret(
        chaincode: [u8; 32],
        secret: &[u8; 32],
        public: Option<Vec<u8>>,
        compressed: bool,
    ) -> Result<Self> {
        let secret = SecretKey::from_slice(secret)?;
        Ok(Self { chaincode, compressed, secret: Some(secret), public })
    }

    /// Returns the chaincode.
    pub fn chaincode(&self) -> &[u8; 32] {
        &self.chaincode
    }

    /// Returns whether public keys use the compressed encoding.
    pub fn is_compressed(&self) -> bool {
        self.compressed
    }

    /// Returns the secret key bytes and the compression flag, or
    /// [`Error::MissingKey`] for watch-only keys.
    pub fn secret(&self) -> Result<([u8; 32], bool)> {
        let Some(secret) = &self.secret else { return Err(Error::MissingKey) };
        Ok((secret.secret_bytes(), self.compressed))
    }

    /// Returns the SEC1-encoded public key, computing and caching it from
    /// the secret key on first use.
    pub fn public(&mut self) -> Result<&[u8]> {
        if self.public.is_none() {
            let Some(secret) = &self.secret else { return Err(Error::MissingKey) };
            let point = PublicKey::from_secret_key(&*SECP256K1, secret);
            self.public = Some(encode_point(&point, self.compressed));
        }
        self.public.as_deref().ok_or(Error::MissingKey)
    }

    /// Returns the watch-only counterpart: the same chaincode, compression
    /// flag, and encoded public key, but no secret.
    pub fn neuter(&mut self) -> Result<HdKey> {
        let public = self.public()?.to_vec();
        Ok(HdKey {
            chaincode: self.chaincode,
            compressed: self.compressed,
            secret: None,
            public: Some(public),
        })
    }

    /// Derives the child key at the given index. A spending key derives a
    /// spending child (public key left uncomputed), a watch-only key
    /// derives a watch-only child. The child inherits the compression
    /// flag.
    ///
    /// Degenerate HMAC outputs (a scalar at or above the curve order, or a
    /// zero child key) are not handled specially: the backend rejects
    /// them, which surfaces as [`Error::Crypto`].
    pub fn derive(&mut self, index: u32) -> Result<HdKey> {
        let public = self.public()?.to_vec();

        let mut mac = HmacSha512::new_from_slice(&self.chaincode)
            .map_err(|err| Error::Crypto(err.to_string()))?;
        mac.update(&public);
        mac.update(&index.to_be_bytes());
        let m = mac.finalize().into_bytes();

        let mut chaincode = [0u8; 32];
        chaincode.copy_from_slice(&m[32..]);
        let mut left = [0u8; 32];
        left.copy_from_slice(&m[..32]);
        let tweak = Scalar::from_be_bytes(left).map_err(|err| Error::Crypto(err.to_string()))?;

        if let Some(secret) = self.secret {
            let child = secret.mul_tweak(&tweak)?;
            Ok(HdKey { chaincode, compressed: self.compressed, secret: Some(child), public: None })
        } else {
            let parent = PublicKey::from_slice(&public)?;
            let child = parent.mul_tweak(&*SECP256K1, &tweak)?;
            Ok(HdKey {
                chaincode,
                compressed: self.compressed,
                secret: None,
                public: Some(encode_point(&child, self.compressed)),
            })
        }
    }
}

/// Encodes a curve point in SEC1 form, compressed or uncompressed.
fn encode_point(point: &PublicKey, compressed: bool) -> Vec<u8> {
    if compressed {
        point.serialize().to_vec()
    } else {
        point.serialize_uncompressed().to_vec()
    }
}
