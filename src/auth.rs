//! 认证方式解析
//!
//! Turns an [`AuthMethod`] and its secret into the ordered list of
//! mechanisms the session offers to the server. Only the key file read
//! touches the outside world.

use std::fmt;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use directories::BaseDirs;
use russh::keys::{decode_secret_key, PrivateKey};
use tracing::debug;

use crate::config::{expand_tilde, AuthMethod};
use crate::error::AuthError;

/// One way of proving identity to the SSH server.
#[derive(Clone)]
pub enum AuthMechanism {
    Password(String),
    PublicKey(Arc<PrivateKey>),
}

impl AuthMechanism {
    pub fn label(&self) -> &'static str {
        match self {
            AuthMechanism::Password(_) => "password",
            AuthMechanism::PublicKey(_) => "publickey",
        }
    }
}

// 不在日志中输出密码或私钥
impl fmt::Debug for AuthMechanism {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthMechanism::Password(_) => f.write_str("Password(***)"),
            AuthMechanism::PublicKey(key) => f
                .debug_tuple("PublicKey")
                .field(&key.algorithm().to_string())
                .finish(),
        }
    }
}

/// `$HOME/.ssh/id_rsa`, or a relative `.ssh/id_rsa` when no home is known.
pub fn default_key_path() -> PathBuf {
    match BaseDirs::new() {
        Some(dirs) => dirs.home_dir().join(".ssh").join("id_rsa"),
        None => PathBuf::from(".ssh").join("id_rsa"),
    }
}

/// Resolve the mechanisms for `method`.
///
/// For [`AuthMethod::Password`] the secret is the password and is used as
/// given, even when empty. For [`AuthMethod::Key`] the secret is an optional
/// key path; without one the default key is used.
pub fn resolve(method: AuthMethod, secret: Option<&str>) -> Result<Vec<AuthMechanism>, AuthError> {
    match method {
        AuthMethod::Password => Ok(vec![AuthMechanism::Password(secret.unwrap_or_default().to_string())]),
        AuthMethod::Key => {
            let path = secret.map(expand_tilde).unwrap_or_else(default_key_path);
            let key = load_private_key(path)?;
            Ok(vec![AuthMechanism::PublicKey(Arc::new(key))])
        }
    }
}

/// Read and parse an unencrypted private key.
///
/// Passphrase-protected keys are reported as [`AuthError::KeyParse`].
pub fn load_private_key(path: PathBuf) -> Result<PrivateKey, AuthError> {
    let data = fs::read_to_string(&path).map_err(|source| AuthError::KeyLoad {
        path: path.clone(),
        source,
    })?;
    let key = decode_secret_key(&data, None).map_err(|source| AuthError::KeyParse {
        path: path.clone(),
        source,
    })?;
    debug!(path = %path.display(), algorithm = %key.algorithm(), "私钥加载完成");
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_password_is_accepted() {
        let mechanisms = resolve(AuthMethod::Password, Some("")).unwrap();
        assert_eq!(mechanisms.len(), 1);
        assert!(matches!(&mechanisms[0], AuthMechanism::Password(p) if p.is_empty()));

        let mechanisms = resolve(AuthMethod::Password, None).unwrap();
        assert!(matches!(&mechanisms[0], AuthMechanism::Password(p) if p.is_empty()));
    }

    #[test]
    fn missing_key_file_is_a_load_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("id_rsa");
        let err = resolve(AuthMethod::Key, path.to_str()).unwrap_err();
        assert!(matches!(err, AuthError::KeyLoad { .. }), "{}", err);
    }

    #[test]
    fn garbage_key_file_is_a_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("id_rsa");
        std::fs::write(&path, "not a private key").unwrap();
        let err = resolve(AuthMethod::Key, path.to_str()).unwrap_err();
        assert!(matches!(err, AuthError::KeyParse { .. }), "{}", err);
    }

    #[test]
    fn valid_key_file_yields_public_key_mechanism() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("id_ed25519");
        let key = PrivateKey::random(&mut rand::thread_rng(), russh::keys::Algorithm::Ed25519).unwrap();
        let mut pem = Vec::new();
        russh::keys::encode_pkcs8_pem(&key, &mut pem).unwrap();
        std::fs::write(&path, pem).unwrap();

        let mechanisms = resolve(AuthMethod::Key, path.to_str()).unwrap();
        assert_eq!(mechanisms.len(), 1);
        assert_eq!(mechanisms[0].label(), "publickey");
        match &mechanisms[0] {
            AuthMechanism::PublicKey(loaded) => assert_eq!(loaded.public_key(), key.public_key()),
            other => panic!("unexpected mechanism {:?}", other),
        }
    }

    #[test]
    fn default_key_path_points_at_id_rsa() {
        assert!(default_key_path().ends_with(".ssh/id_rsa"));
    }
}
