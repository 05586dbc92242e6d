//! Cryptographic capability consumed by the mesh layer
//!
//! The stack never touches cipher implementations directly; it calls a
//! [`MeshCrypto`] so hosts can route the primitives to a hardware engine.
//! [`SoftCrypto`] is the default software implementation:
//! - AES-128 single block encryption (node identity hash)
//! - AES-CMAC (salt and key derivation, provisioning confirmation)
//! - AES-CCM with an 8-byte MIC (provisioning data)
//! - P-256 ECDH with raw big-endian `X || Y` public keys

use aes::cipher::{generic_array::GenericArray, BlockEncrypt, KeyInit};
use aes::Aes128;
use ccm::aead::AeadInPlace;
use ccm::consts::{U13, U8};
use ccm::Ccm;
use cmac::{Cmac, Mac};
use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::{PublicKey, SecretKey};
use rand::rngs::OsRng;
use rand::RngCore;
use thiserror::Error;

/// Length of a raw P-256 public key (X || Y)
pub const PUB_KEY_LEN: usize = 64;
/// Length of the ECDH shared secret
pub const DH_KEY_LEN: usize = 32;
/// CCM MIC length used for provisioning data
pub const CCM_MIC_LEN: usize = 8;

type Aes128Ccm8 = Ccm<Aes128, U8, U13>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("Invalid key material")]
    InvalidKey,
    #[error("Invalid public key")]
    InvalidPublicKey,
    #[error("No local key pair")]
    NoKeyPair,
    #[error("Authentication failed")]
    Decrypt,
    #[error("Input too short")]
    TooShort,
}

pub trait MeshCrypto: Send {
    /// AES-CMAC over the concatenation of `parts`
    fn aes_cmac(&self, key: &[u8; 16], parts: &[&[u8]]) -> Result<[u8; 16], CryptoError>;

    /// AES-128 encryption of a single block
    fn aes_encrypt(&self, key: &[u8; 16], block: &[u8; 16]) -> Result<[u8; 16], CryptoError>;

    /// AES-CCM encryption, returning ciphertext followed by an 8-byte MIC
    fn ccm_encrypt(
        &self,
        key: &[u8; 16],
        nonce: &[u8; 13],
        data: &[u8],
    ) -> Result<Vec<u8>, CryptoError>;

    /// AES-CCM decryption of ciphertext followed by an 8-byte MIC
    fn ccm_decrypt(
        &self,
        key: &[u8; 16],
        nonce: &[u8; 13],
        data: &[u8],
    ) -> Result<Vec<u8>, CryptoError>;

    /// Generate a fresh local key pair, returning the public key
    fn generate_key_pair(&mut self) -> Result<[u8; PUB_KEY_LEN], CryptoError>;

    fn public_key(&self) -> Option<[u8; PUB_KEY_LEN]>;

    /// ECDH between the local private key and `peer`
    fn dh_key(&self, peer: &[u8; PUB_KEY_LEN]) -> Result<[u8; DH_KEY_LEN], CryptoError>;

    fn rand(&mut self, buf: &mut [u8]);
}

/// Software implementation backed by RustCrypto
#[derive(Default)]
pub struct SoftCrypto {
    secret: Option<SecretKey>,
}

impl SoftCrypto {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MeshCrypto for SoftCrypto {
    fn aes_cmac(&self, key: &[u8; 16], parts: &[&[u8]]) -> Result<[u8; 16], CryptoError> {
        let mut mac =
            <Cmac<Aes128> as Mac>::new_from_slice(key).map_err(|_| CryptoError::InvalidKey)?;
        for part in parts {
            mac.update(part);
        }
        let mut out = [0u8; 16];
        out.copy_from_slice(&mac.finalize().into_bytes());
        Ok(out)
    }

    fn aes_encrypt(&self, key: &[u8; 16], block: &[u8; 16]) -> Result<[u8; 16], CryptoError> {
        let cipher = Aes128::new(GenericArray::from_slice(key));
        let mut buf = GenericArray::clone_from_slice(block);
        cipher.encrypt_block(&mut buf);
        let mut out = [0u8; 16];
        out.copy_from_slice(&buf);
        Ok(out)
    }

    fn ccm_encrypt(
        &self,
        key: &[u8; 16],
        nonce: &[u8; 13],
        data: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        let cipher = Aes128Ccm8::new_from_slice(key).map_err(|_| CryptoError::InvalidKey)?;
        let mut buf = data.to_vec();
        let tag = cipher
            .encrypt_in_place_detached(GenericArray::from_slice(nonce), &[], &mut buf)
            .map_err(|_| CryptoError::InvalidKey)?;
        buf.extend_from_slice(&tag);
        Ok(buf)
    }

    fn ccm_decrypt(
        &self,
        key: &[u8; 16],
        nonce: &[u8; 13],
        data: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        if data.len() < CCM_MIC_LEN {
            return Err(CryptoError::TooShort);
        }
        let cipher = Aes128Ccm8::new_from_slice(key).map_err(|_| CryptoError::InvalidKey)?;
        let (ct, tag) = data.split_at(data.len() - CCM_MIC_LEN);
        let mut buf = ct.to_vec();
        cipher
            .decrypt_in_place_detached(
                GenericArray::from_slice(nonce),
                &[],
                &mut buf,
                GenericArray::from_slice(tag),
            )
            .map_err(|_| CryptoError::Decrypt)?;
        Ok(buf)
    }

    fn generate_key_pair(&mut self) -> Result<[u8; PUB_KEY_LEN], CryptoError> {
        let secret = SecretKey::random(&mut OsRng);
        self.secret = Some(secret);
        self.public_key().ok_or(CryptoError::NoKeyPair)
    }

    fn public_key(&self) -> Option<[u8; PUB_KEY_LEN]> {
        let point = self.secret.as_ref()?.public_key().to_encoded_point(false);
        // Uncompressed SEC1: 0x04 || X || Y
        let bytes = point.as_bytes();
        let mut out = [0u8; PUB_KEY_LEN];
        out.copy_from_slice(bytes.get(1..1 + PUB_KEY_LEN)?);
        Some(out)
    }

    fn dh_key(&self, peer: &[u8; PUB_KEY_LEN]) -> Result<[u8; DH_KEY_LEN], CryptoError> {
        let secret = self.secret.as_ref().ok_or(CryptoError::NoKeyPair)?;
        let mut sec1 = [0u8; PUB_KEY_LEN + 1];
        sec1[0] = 0x04;
        sec1[1..].copy_from_slice(peer);
        let peer = PublicKey::from_sec1_bytes(&sec1).map_err(|_| CryptoError::InvalidPublicKey)?;
        let shared = p256::ecdh::diffie_hellman(secret.to_nonzero_scalar(), peer.as_affine());
        let mut out = [0u8; DH_KEY_LEN];
        out.copy_from_slice(shared.raw_secret_bytes());
        Ok(out)
    }

    fn rand(&mut self, buf: &mut [u8]) {
        OsRng.fill_bytes(buf);
    }
}

/// s1 salt generation: AES-CMAC with an all-zero key
pub fn s1(crypto: &dyn MeshCrypto, m: &[u8]) -> Result<[u8; 16], CryptoError> {
    crypto.aes_cmac(&[0u8; 16], &[m])
}

/// k1 derivation: two chained CMACs, `CMAC(CMAC(salt, n), p)`
pub fn k1(
    crypto: &dyn MeshCrypto,
    n: &[u8],
    salt: &[u8; 16],
    p: &[u8],
) -> Result<[u8; 16], CryptoError> {
    let t = crypto.aes_cmac(salt, &[n])?;
    crypto.aes_cmac(&t, &[p])
}

/// k3 derivation: 64-bit network ID of a network key
pub fn k3(crypto: &dyn MeshCrypto, n: &[u8; 16]) -> Result<[u8; 8], CryptoError> {
    let salt = s1(crypto, b"smk3")?;
    let t = crypto.aes_cmac(&salt, &[n])?;
    let out = crypto.aes_cmac(&t, &[b"id64", &[0x01]])?;
    let mut id = [0u8; 8];
    id.copy_from_slice(&out[8..]);
    Ok(id)
}

/// Identity key used for node identity advertising
pub fn identity_key(crypto: &dyn MeshCrypto, net_key: &[u8; 16]) -> Result<[u8; 16], CryptoError> {
    let salt = s1(crypto, b"nkik")?;
    k1(crypto, net_key, &salt, b"id128\x01")
}

/// Virtual address of a Label UUID
pub fn virtual_addr(crypto: &dyn MeshCrypto, label: &[u8; 16]) -> Result<u16, CryptoError> {
    let salt = s1(crypto, b"vtad")?;
    let hash = crypto.aes_cmac(&salt, &[label])?;
    Ok((u16::from_be_bytes([hash[14], hash[15]]) & 0x3fff) | 0x8000)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unhex<const N: usize>(s: &str) -> [u8; N] {
        let bytes = hex::decode(s).expect("valid hex");
        bytes.try_into().expect("length")
    }

    #[test]
    fn test_aes_cmac_rfc4493_vectors() {
        let crypto = SoftCrypto::new();
        let key: [u8; 16] = unhex("2b7e151628aed2a6abf7158809cf4f3c");

        let empty = crypto.aes_cmac(&key, &[]).unwrap();
        assert_eq!(hex::encode(empty), "bb1d6929e95937287fa37d129b756746");

        let msg: [u8; 16] = unhex("6bc1bee22e409f96e93d7e117393172a");
        let split = crypto.aes_cmac(&key, &[&msg[..5], &msg[5..]]).unwrap();
        assert_eq!(hex::encode(split), "070a16b46b4d4144f79bdd9dd04a287c");
    }

    #[test]
    fn test_s1_sample_data() {
        let crypto = SoftCrypto::new();
        let salt = s1(&crypto, b"test").unwrap();
        assert_eq!(hex::encode(salt), "b73cefbd641ef2ea598c2b6efb62f79c");
    }

    #[test]
    fn test_k3_sample_data() {
        let crypto = SoftCrypto::new();
        let id = k3(&crypto, &unhex("f7a2a44f8e8a8029064f173ddc1e2b00")).unwrap();
        assert_eq!(hex::encode(id), "ff046958233db014");
    }

    #[test]
    fn test_ccm_roundtrip_and_tamper() {
        let crypto = SoftCrypto::new();
        let key = [0x11u8; 16];
        let nonce = [0x22u8; 13];
        let sealed = crypto.ccm_encrypt(&key, &nonce, b"provisioning data").unwrap();
        assert_eq!(sealed.len(), 17 + CCM_MIC_LEN);

        let opened = crypto.ccm_decrypt(&key, &nonce, &sealed).unwrap();
        assert_eq!(opened, b"provisioning data");

        let mut tampered = sealed.clone();
        tampered[0] ^= 1;
        assert_eq!(
            crypto.ccm_decrypt(&key, &nonce, &tampered),
            Err(CryptoError::Decrypt)
        );
    }

    #[test]
    fn test_ecdh_agreement() {
        let mut alice = SoftCrypto::new();
        let mut bob = SoftCrypto::new();
        let alice_pub = alice.generate_key_pair().unwrap();
        let bob_pub = bob.generate_key_pair().unwrap();

        assert_eq!(
            alice.dh_key(&bob_pub).unwrap(),
            bob.dh_key(&alice_pub).unwrap()
        );
    }

    #[test]
    fn test_dh_rejects_point_not_on_curve() {
        let mut crypto = SoftCrypto::new();
        crypto.generate_key_pair().unwrap();
        assert_eq!(
            crypto.dh_key(&[0x01; PUB_KEY_LEN]),
            Err(CryptoError::InvalidPublicKey)
        );
    }

    #[test]
    fn test_virtual_addr_in_virtual_range() {
        let crypto = SoftCrypto::new();
        let addr = virtual_addr(&crypto, &[0xab; 16]).unwrap();
        assert!(crate::addr::is_virtual(addr));
    }
}
