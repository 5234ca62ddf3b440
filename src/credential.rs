use std::fs;
use std::io;
use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    #[error("no access token available")]
    Missing,
    #[error("reading token file {}: {source}", path.display())]
    Io { path: PathBuf, source: io::Error },
}

/// Hands out the current access token. Implementations are read on every
/// connect attempt and every REST call, so rotating the token only needs the
/// underlying storage to change.
pub trait TokenSource: Send + Sync {
    fn access_token(&self) -> Result<String, CredentialError>;
}

pub struct StaticToken(String);

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }
}

impl TokenSource for StaticToken {
    fn access_token(&self) -> Result<String, CredentialError> {
        if self.0.is_empty() {
            return Err(CredentialError::Missing);
        }
        Ok(self.0.clone())
    }
}

pub struct TokenFile {
    path: PathBuf,
}

impl TokenFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl TokenSource for TokenFile {
    fn access_token(&self) -> Result<String, CredentialError> {
        let token = fs::read_to_string(&self.path).map_err(|source| CredentialError::Io {
            path: self.path.clone(),
            source,
        })?;
        let token = token.trim();
        if token.is_empty() {
            return Err(CredentialError::Missing);
        }
        Ok(token.to_string())
    }
}
