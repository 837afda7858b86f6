// Copyright 2025 Dustin McAfee
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! VNC (DES challenge/response) authentication.
//!
//! Server-side counterpart of RFC 6143 §7.2.2: the server generates a
//! 16-byte challenge, the client encrypts it with its password (bit-reversed
//! into a DES key, two independent 8-byte ECB blocks), and the server
//! checks the response against its own copy of the password.

use async_trait::async_trait;
use cipher::{BlockEncrypt, KeyInit};
use des::Des;
use rand::RngCore;

/// Verifies VNC authentication responses. Implementors decide where the
/// password comes from (a static secret, a keyring, a remote auth service)
/// — `async_trait` so that lookup can involve I/O.
#[async_trait]
pub trait PasswordChallenge: Send + Sync {
    /// Generates a fresh 16-byte challenge to send to the client.
    async fn generate_challenge(&self) -> [u8; 16];

    /// Checks a client's 16-byte response against the challenge previously
    /// issued to it. Returns `true` on success.
    async fn verify_response(&self, challenge: &[u8; 16], response: &[u8; 16]) -> bool;
}

/// A [`PasswordChallenge`] backed by a single static password, held in
/// memory for the session's lifetime.
pub struct StaticPasswordChallenge {
    password: Vec<u8>,
}

impl StaticPasswordChallenge {
    /// Creates a challenge verifier for the given password. Only the first
    /// 8 bytes are significant, per the VNC auth wire format.
    #[must_use]
    pub fn new(password: impl Into<String>) -> Self {
        Self { password: password.into().into_bytes() }
    }
}

#[async_trait]
impl PasswordChallenge for StaticPasswordChallenge {
    async fn generate_challenge(&self) -> [u8; 16] {
        let mut challenge = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut challenge);
        challenge
    }

    async fn verify_response(&self, challenge: &[u8; 16], response: &[u8; 16]) -> bool {
        let key = make_des_key(&self.password);
        let mut expected = [0u8; 16];
        expected[..8].copy_from_slice(&des_encrypt_block(&key, &challenge[..8]));
        expected[8..].copy_from_slice(&des_encrypt_block(&key, &challenge[8..]));
        let matches = expected == *response;
        expected.iter_mut().for_each(|b| *b = 0);
        matches
    }
}

impl Drop for StaticPasswordChallenge {
    fn drop(&mut self) {
        self.password.iter_mut().for_each(|b| *b = 0);
    }
}

/// Builds the 8-byte DES key VNC auth uses: the password truncated/padded
/// to 8 bytes, each byte bit-reversed.
fn make_des_key(password: &[u8]) -> [u8; 8] {
    let mut key = [0u8; 8];
    let n = password.len().min(8);
    key[..n].copy_from_slice(&password[..n]);
    for b in &mut key {
        *b = b.reverse_bits();
    }
    key
}

/// Encrypts one 8-byte ECB block with the given DES key.
fn des_encrypt_block(key: &[u8; 8], block: &[u8]) -> [u8; 8] {
    let cipher = Des::new_from_slice(key).expect("DES key is always 8 bytes");
    let mut output = cipher::generic_array::GenericArray::clone_from_slice(&block[..8]);
    cipher.encrypt_block(&mut output);
    let mut result = [0u8; 8];
    result.copy_from_slice(&output);
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn make_des_key_reverses_bits_and_pads() {
        let key = make_des_key(b"ab");
        assert_eq!(key[0], b'a'.reverse_bits());
        assert_eq!(key[1], b'b'.reverse_bits());
        assert_eq!(&key[2..], &[0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn des_encrypt_block_known_vector() {
        let key = [0x01, 0x23, 0x45, 0x67, 0x89, 0xAB, 0xCD, 0xEF];
        let plaintext = [0x4E, 0x6F, 0x77, 0x20, 0x69, 0x73, 0x20, 0x74];
        let expected = [0x3F, 0xA4, 0x0E, 0x8A, 0x98, 0x4D, 0x48, 0x15];
        assert_eq!(des_encrypt_block(&key, &plaintext), expected);
    }

    #[tokio::test]
    async fn correct_password_verifies() {
        let challenge_source = StaticPasswordChallenge::new("secret1");
        let challenge = [7u8; 16];
        let key = make_des_key(b"secret1");
        let mut response = [0u8; 16];
        response[..8].copy_from_slice(&des_encrypt_block(&key, &challenge[..8]));
        response[8..].copy_from_slice(&des_encrypt_block(&key, &challenge[8..]));
        assert!(challenge_source.verify_response(&challenge, &response).await);
    }

    #[tokio::test]
    async fn wrong_password_fails() {
        let challenge_source = StaticPasswordChallenge::new("secret1");
        let challenge = [7u8; 16];
        let response = [0u8; 16];
        assert!(!challenge_source.verify_response(&challenge, &response).await);
    }

    #[tokio::test]
    async fn generated_challenges_differ() {
        let challenge_source = StaticPasswordChallenge::new("secret1");
        let a = challenge_source.generate_challenge().await;
        let b = challenge_source.generate_challenge().await;
        assert_ne!(a, b);
    }
}
