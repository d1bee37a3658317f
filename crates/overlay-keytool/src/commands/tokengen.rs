//! `overlay-keytool tokengen` — mint a Notary token for a payload.
//! Grounded on `original_source/cmd/tokengen/main.go`: sign-key and
//! verify-key are supplied base64url-encoded on the command line, not
//! read from a store.

use anyhow::{Context, Result};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;

use overlay_core::notary::{Algorithm, Notary};

pub fn run(
    payload: &str,
    domain: &str,
    algorithm: &str,
    sign_key: &str,
    verify_key: Option<&str>,
) -> Result<()> {
    let algorithm = Algorithm::parse(algorithm).context("unknown algorithm")?;
    let sign_key_bytes = URL_SAFE_NO_PAD
        .decode(sign_key)
        .context("signkey is not valid base64url")?;
    let verify_key_bytes = verify_key
        .map(|k| URL_SAFE_NO_PAD.decode(k))
        .transpose()
        .context("verifykey is not valid base64url")?;

    let notary = Notary::new(true, None);
    let token = notary.encode_token(
        payload.as_bytes(),
        domain,
        algorithm,
        Some(&sign_key_bytes),
        verify_key_bytes.as_deref(),
    )?;

    println!("token: {token}");
    Ok(())
}
