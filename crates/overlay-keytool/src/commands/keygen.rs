//! `overlay-keytool keygen` — generate an Ed25519 key pair for the
//! Notary. Grounded on `original_source/cmd/keygen/main.go`: no
//! persistence, just mint a pair and print it.

use anyhow::Result;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;

use overlay_core::notary::{Algorithm, Notary};

pub fn run() -> Result<()> {
    let notary = Notary::new(true, None);
    let (verify_key, sign_key) = notary.generate_keypair(Algorithm::Ed25519)?;

    let verify_encoded = URL_SAFE_NO_PAD.encode(&verify_key);
    let sign_encoded = URL_SAFE_NO_PAD.encode(&sign_key);

    println!("algorithm: {}", Algorithm::Ed25519.as_str());
    println!("verifykey: {verify_encoded}");
    println!("  signkey: {sign_encoded}");

    Ok(())
}
