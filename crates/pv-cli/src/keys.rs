//! SSH key generation

use rand::rngs::OsRng;
use ssh_key::{Algorithm, LineEnding, PrivateKey};

use pv_core::types::SshKeyPair;

/// Generate a new Ed25519 key pair
pub fn generate_key_pair(name: &str) -> Result<SshKeyPair, ssh_key::Error> {
    let private = PrivateKey::random(&mut OsRng, Algorithm::Ed25519)?;
    key_pair_from_private(name, &private)
}

/// Key pair for an existing OpenSSH private key
pub fn import_key_pair(name: &str, private_key: &str) -> Result<SshKeyPair, ssh_key::Error> {
    let private = PrivateKey::from_openssh(private_key)?;
    key_pair_from_private(name, &private)
}

fn key_pair_from_private(name: &str, private: &PrivateKey) -> Result<SshKeyPair, ssh_key::Error> {
    Ok(SshKeyPair {
        name: name.to_string(),
        private_key: private.to_openssh(LineEnding::LF)?.to_string(),
        public_key: private.public_key().to_openssh()?,
    })
}
