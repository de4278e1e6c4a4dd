//! Authentication handshake
//!
//! Builds the CONNECT payload from the resolved options, the server's INFO,
//! and any credentials embedded in the dialed URL. Nonce signing and
//! seed-to-keypair derivation are not implemented here; they enter through
//! the [`NonceSigner`] seam.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

use wisp_core::proto::ConnectInfo;
use wisp_core::ServerInfo;

use crate::error::{Error, Result};
use crate::options::Options;
use crate::servers::UrlAuth;

/// Signs server nonces. Implementations wrap an Ed25519 seed; the client
/// never sees key material beyond the seed string it hands back out.
pub trait NonceSigner: Send + Sync {
    fn sign(&self, nonce: &[u8]) -> Result<Vec<u8>>;
}

impl<F> NonceSigner for F
where
    F: Fn(&[u8]) -> Result<Vec<u8>> + Send + Sync,
{
    fn sign(&self, nonce: &[u8]) -> Result<Vec<u8>> {
        self(nonce)
    }
}

/// Signature primitive for chained credentials: (seed, nonce) -> signature
pub(crate) type SeedSigner = dyn Fn(&str, &[u8]) -> Result<Vec<u8>> + Send + Sync;

/// Parsed chained credentials
#[derive(Debug, Clone)]
pub struct Creds {
    pub jwt: String,
    pub seed: String,
}

/// Parse a chained credentials file: two PEM-like fenced blocks, the first
/// holding the user JWT and the second the nkey seed.
pub(crate) fn parse_creds(content: &str) -> Result<Creds> {
    let mut blocks: Vec<String> = Vec::new();
    let mut current: Option<Vec<&str>> = None;

    // Real credential files are sloppy about fence widths (five dashes on
    // BEGIN, six on END), so match on the keyword between dashes.
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.starts_with('-') && trimmed.contains("BEGIN") && trimmed.ends_with('-') {
            current = Some(Vec::new());
        } else if trimmed.starts_with('-') && trimmed.contains("END") && trimmed.ends_with('-') {
            if let Some(lines) = current.take() {
                blocks.push(lines.join(""));
            }
        } else if let Some(lines) = current.as_mut() {
            if !trimmed.is_empty() {
                lines.push(trimmed);
            }
        }
    }

    if blocks.is_empty() {
        return Err(Error::BadCredentials("no fenced blocks found".into()));
    }
    if blocks.len() < 2 {
        return Err(Error::NoSeedInCreds);
    }

    let jwt = blocks[0].clone();
    let seed = blocks[1].clone();
    if jwt.is_empty() {
        return Err(Error::NoUserJwtInCreds);
    }
    if seed.is_empty() {
        return Err(Error::NoSeedInCreds);
    }

    Ok(Creds { jwt, seed })
}

/// Assemble the CONNECT payload.
///
/// URL-embedded credentials fill only fields the caller did not set. When
/// the server presented a nonce, a signer is mandatory and either an nkey
/// or a user JWT must identify the client.
pub(crate) fn build_connect(
    opts: &Options,
    info: &ServerInfo,
    url_auth: Option<&UrlAuth>,
) -> Result<ConnectInfo> {
    let mut connect = ConnectInfo::new(opts.verbose, opts.pedantic);
    connect.name = opts.name.clone();

    let mut user = opts.user.clone();
    let mut pass = opts.pass.clone();
    let mut token = opts.token.clone();
    match url_auth {
        Some(UrlAuth::UserPass(u, p)) => {
            if user.is_none() && token.is_none() {
                user = Some(u.clone());
                pass = Some(p.clone());
            }
        }
        Some(UrlAuth::Token(t)) => {
            if token.is_none() && user.is_none() {
                token = Some(t.clone());
            }
        }
        None => {}
    }

    if user.is_some() && token.is_some() {
        return Err(Error::BadAuthentication);
    }

    if let Some(nonce) = info.nonce.as_deref() {
        let signer = opts.signer.as_ref().ok_or(Error::SignatureRequired)?;
        // The nonce string is base64 of the bytes to sign; fall back to the
        // raw bytes when a server sends it unencoded.
        let nonce_bytes = BASE64
            .decode(nonce)
            .unwrap_or_else(|_| nonce.as_bytes().to_vec());
        let sig = signer.sign(&nonce_bytes)?;
        connect.sig = Some(BASE64.encode(sig));

        let jwt = opts
            .creds
            .as_ref()
            .map(|c| c.jwt.clone())
            .or_else(|| opts.user_jwt.as_ref().map(|j| j.resolve()));
        if jwt.is_none() && opts.nkey.is_none() {
            return Err(Error::NkeyOrJwtRequired);
        }
        connect.jwt = jwt;
        connect.nkey = opts.nkey.clone();
    }

    connect.user = user;
    connect.pass = pass;
    connect.auth_token = token;

    Ok(connect)
}

#[cfg(test)]
mod tests {
    use super::*;

    const CREDS: &str = r#"-----BEGIN NATS USER JWT-----
eyJ0eXAiOiJqd3QiLCJhbGciOiJlZDI1NTE5In0.payload.sig
------END NATS USER JWT------

************************* IMPORTANT *************************
NKEY Seed printed below can be used to sign and prove identity.

-----BEGIN USER NKEY SEED-----
SUAIBDPBAUTWCWBKIO6XHQNINK5FWJW4OHLXC3HQ2KFE4PEJUA44CNHTC4
------END USER NKEY SEED------
"#;

    #[test]
    fn test_parse_creds() {
        let creds = parse_creds(CREDS).unwrap();
        assert!(creds.jwt.starts_with("eyJ0eXAi"));
        assert!(creds.seed.starts_with("SUAIBDPBAUTWCWBKIO6X"));
    }

    #[test]
    fn test_parse_creds_no_blocks() {
        let err = parse_creds("not a creds file").unwrap_err();
        assert_eq!(err.code(), "BAD_CREDENTIALS");
    }

    #[test]
    fn test_parse_creds_missing_seed() {
        let partial = "-----BEGIN NATS USER JWT-----\njwt.here\n-----END NATS USER JWT-----\n";
        let err = parse_creds(partial).unwrap_err();
        assert_eq!(err.code(), "NO_SEED_IN_CREDS");
    }

    #[test]
    fn test_connect_plain() {
        let opts = Options::default();
        let info = ServerInfo::default();
        let connect = build_connect(&opts, &info, None).unwrap();
        assert!(connect.sig.is_none());
        assert!(connect.user.is_none());
        assert_eq!(connect.protocol, 1);
    }

    #[test]
    fn test_connect_url_auth_fills_unset_fields() {
        let opts = Options::default();
        let info = ServerInfo::default();
        let auth = UrlAuth::UserPass("u".into(), "p".into());
        let connect = build_connect(&opts, &info, Some(&auth)).unwrap();
        assert_eq!(connect.user.as_deref(), Some("u"));
        assert_eq!(connect.pass.as_deref(), Some("p"));
    }

    #[test]
    fn test_connect_explicit_user_wins_over_url() {
        let mut opts = Options::default();
        opts.user = Some("explicit".into());
        opts.pass = Some("pw".into());
        let info = ServerInfo::default();
        let auth = UrlAuth::UserPass("url-user".into(), "url-pass".into());
        let connect = build_connect(&opts, &info, Some(&auth)).unwrap();
        assert_eq!(connect.user.as_deref(), Some("explicit"));
        assert_eq!(connect.pass.as_deref(), Some("pw"));
    }

    #[test]
    fn test_connect_user_and_token_conflict() {
        let mut opts = Options::default();
        opts.user = Some("u".into());
        opts.token = Some("t".into());
        let err = build_connect(&opts, &ServerInfo::default(), None).unwrap_err();
        assert_eq!(err.code(), "BAD_AUTHENTICATION");
    }

    #[test]
    fn test_nonce_without_signer_fails() {
        let opts = Options::default();
        let mut info = ServerInfo::default();
        info.nonce = Some("bm9uY2U=".into());
        let err = build_connect(&opts, &info, None).unwrap_err();
        assert_eq!(err.code(), "SIG_REQ");
    }

    #[test]
    fn test_nonce_with_signer_needs_identity() {
        let mut opts = Options::default();
        opts.signer = Some(std::sync::Arc::new(|nonce: &[u8]| -> Result<Vec<u8>> {
            Ok(nonce.to_vec())
        }));
        let mut info = ServerInfo::default();
        info.nonce = Some("bm9uY2U=".into());
        let err = build_connect(&opts, &info, None).unwrap_err();
        assert_eq!(err.code(), "NKEY_OR_JWT_REQ");
    }

    #[test]
    fn test_nonce_signed_with_nkey() {
        let mut opts = Options::default();
        opts.signer = Some(std::sync::Arc::new(|nonce: &[u8]| -> Result<Vec<u8>> {
            Ok(nonce.iter().rev().copied().collect())
        }));
        opts.nkey = Some("UAAA…PUBLIC".into());
        let mut info = ServerInfo::default();
        info.nonce = Some(BASE64.encode(b"nonce-bytes"));
        let connect = build_connect(&opts, &info, None).unwrap();
        let sig = connect.sig.expect("signature present");
        let decoded = BASE64.decode(sig).unwrap();
        let reversed: Vec<u8> = b"nonce-bytes".iter().rev().copied().collect();
        assert_eq!(decoded, reversed);
        assert_eq!(connect.nkey.as_deref(), Some("UAAA…PUBLIC"));
    }
}
