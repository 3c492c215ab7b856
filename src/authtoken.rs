// For reference on JWT specification for APNs: https://developer.apple.com/documentation/usernotifications/setting_up_a_remote_notification_server/establishing_a_token-based_connection_to_apns

use base64::{engine::general_purpose, Engine};
use openssl::{hash::MessageDigest, pkey::PKey, sign::Signer};
use std::{
    fs,
    path::PathBuf,
    time::{SystemTime, UNIX_EPOCH},
};

use crate::error::AuthTokenError;

/// Credentials needed to sign APNs provider tokens.
#[derive(Debug, Clone)]
pub struct ApnsCredentials {
    pub key_path: PathBuf,
    pub key_id: String,
    pub team_id: String,
}

/// ES256-signed provider token. APNs wants it refreshed every 20-60 minutes.
pub struct AuthToken {
    pub token: String,
    credentials: ApnsCredentials,
    jwt_header: String,
}

impl AuthToken {
    pub fn new(credentials: ApnsCredentials) -> Result<AuthToken, AuthTokenError> {
        let jwt_header = generate_jwt_header(&credentials.key_id);
        let token = sign_token(&credentials, &jwt_header)?;
        Ok(AuthToken {
            token,
            credentials,
            jwt_header,
        })
    }

    /// Re-issue the token with a fresh `iat`. The old token stays in place on failure.
    pub fn refresh(&mut self) -> Result<(), AuthTokenError> {
        self.token = sign_token(&self.credentials, &self.jwt_header)?;
        Ok(())
    }
}

fn sign_token(credentials: &ApnsCredentials, jwt_header: &str) -> Result<String, AuthTokenError> {
    let jwt_claims = generate_jwt_claims(&credentials.team_id);
    let jwt_signed = generate_jwt_signed(credentials, jwt_header, &jwt_claims)?;
    Ok(format!("{jwt_header}.{jwt_claims}.{jwt_signed}"))
}

fn generate_jwt_header(key_id: &str) -> String {
    general_purpose::STANDARD_NO_PAD
        .encode(format!("{{ \"alg\": \"ES256\", \"kid\": \"{key_id}\" }}").as_bytes())
}

fn generate_jwt_claims(team_id: &str) -> String {
    let issued_at = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default();
    general_purpose::STANDARD_NO_PAD
        .encode(format!("{{ \"iss\": \"{team_id}\", \"iat\": {issued_at} }}").as_bytes())
}

/// Signing using ECDSA
fn generate_jwt_signed(
    credentials: &ApnsCredentials,
    header: &str,
    claims: &str,
) -> Result<String, AuthTokenError> {
    let header_claims = format!("{header}.{claims}");

    let private_key_bytes = fs::read(&credentials.key_path).map_err(|source| AuthTokenError::Io {
        path: credentials.key_path.clone(),
        source,
    })?;
    let key = PKey::private_key_from_pem(&private_key_bytes).map_err(|_| AuthTokenError::BadPrivateKey)?;

    let mut signer = Signer::new(MessageDigest::sha256(), &key)?;
    signer.update(header_claims.as_bytes())?;
    let signed = signer.sign_to_vec()?;

    Ok(general_purpose::STANDARD_NO_PAD.encode(signed))
}

#[cfg(test)]
mod tests {
    use super::*;
    use openssl::{ec::{EcGroup, EcKey}, nid::Nid};

    fn write_test_key(dir: &tempfile::TempDir) -> PathBuf {
        let group = EcGroup::from_curve_name(Nid::X9_62_PRIME256V1).unwrap();
        let key = EcKey::generate(&group).unwrap();
        let pem = PKey::from_ec_key(key).unwrap().private_key_to_pem_pkcs8().unwrap();
        let path = dir.path().join("AuthKey.p8");
        fs::write(&path, pem).unwrap();
        path
    }

    #[test]
    fn token_has_three_segments() {
        let dir = tempfile::tempdir().unwrap();
        let token = AuthToken::new(ApnsCredentials {
            key_path: write_test_key(&dir),
            key_id: "KEY123".into(),
            team_id: "TEAM456".into(),
        })
        .unwrap();
        assert_eq!(token.token.split('.').count(), 3);

        let header = general_purpose::STANDARD_NO_PAD
            .decode(token.token.split('.').next().unwrap())
            .unwrap();
        assert!(String::from_utf8(header).unwrap().contains("KEY123"));
    }

    #[test]
    fn missing_key_file_is_an_io_error() {
        let result = AuthToken::new(ApnsCredentials {
            key_path: PathBuf::from("/nonexistent/AuthKey.p8"),
            key_id: "k".into(),
            team_id: "t".into(),
        });
        assert!(matches!(result, Err(AuthTokenError::Io { .. })));
    }

    #[test]
    fn garbage_key_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.p8");
        fs::write(&path, b"not a key").unwrap();
        let result = AuthToken::new(ApnsCredentials {
            key_path: path,
            key_id: "k".into(),
            team_id: "t".into(),
        });
        assert!(matches!(result, Err(AuthTokenError::BadPrivateKey)));
    }
}
