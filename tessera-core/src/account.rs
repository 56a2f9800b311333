//! Account storage.
//!
//! Credentials for remote object stores: a name, a server URL and an
//! optional bearer token, persisted as a JSON list in the user's config
//! directory. The first account added becomes the default until another is
//! marked as such.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AccountError {
    #[error("no account named {0}")]
    UnknownAccount(String),

    #[error("an account named {0} already exists")]
    DuplicateAccount(String),

    #[error("no accounts configured")]
    NoAccounts,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse accounts file: {0}")]
    Parse(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub name: String,
    pub server_url: String,
    pub token: Option<String>,
    #[serde(default)]
    pub is_default: bool,
    /// When the account was added (Unix seconds).
    pub created_at: i64,
}

impl Account {
    pub fn new(name: impl Into<String>, server_url: impl Into<String>, token: Option<String>) -> Self {
        Self {
            name: name.into(),
            server_url: server_url.into(),
            token,
            is_default: false,
            created_at: Utc::now().timestamp(),
        }
    }
}

/// On-disk account list.
pub struct AccountStore {
    path: PathBuf,
}

impl AccountStore {
    /// Standard location: `<config dir>/tessera/accounts.json`.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("tessera")
            .join("accounts.json")
    }

    pub fn open_default() -> Self {
        Self::open(Self::default_path())
    }

    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load all accounts. A missing file is an empty list.
    pub fn list(&self) -> Result<Vec<Account>, AccountError> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let data = fs::read_to_string(&self.path)?;
        Ok(serde_json::from_str(&data)?)
    }

    /// Look an account up by name.
    pub fn get(&self, name: &str) -> Result<Account, AccountError> {
        self.list()?
            .into_iter()
            .find(|account| account.name == name)
            .ok_or_else(|| AccountError::UnknownAccount(name.to_string()))
    }

    /// The default account: the one marked default, else the first.
    pub fn default_account(&self) -> Result<Account, AccountError> {
        let accounts = self.list()?;
        accounts
            .iter()
            .find(|account| account.is_default)
            .or_else(|| accounts.first())
            .cloned()
            .ok_or(AccountError::NoAccounts)
    }

    /// Add an account. The first account added becomes the default.
    pub fn add(&self, mut account: Account) -> Result<(), AccountError> {
        let mut accounts = self.list()?;
        if accounts.iter().any(|existing| existing.name == account.name) {
            return Err(AccountError::DuplicateAccount(account.name));
        }
        if accounts.is_empty() {
            account.is_default = true;
        }
        accounts.push(account);
        self.save(&accounts)
    }

    /// Remove an account by name. If it was the default, the first remaining
    /// account takes over.
    pub fn remove(&self, name: &str) -> Result<(), AccountError> {
        let mut accounts = self.list()?;
        let before = accounts.len();
        accounts.retain(|account| account.name != name);
        if accounts.len() == before {
            return Err(AccountError::UnknownAccount(name.to_string()));
        }
        if !accounts.iter().any(|account| account.is_default) {
            if let Some(first) = accounts.first_mut() {
                first.is_default = true;
            }
        }
        self.save(&accounts)
    }

    /// Mark an account as the default.
    pub fn set_default(&self, name: &str) -> Result<(), AccountError> {
        let mut accounts = self.list()?;
        if !accounts.iter().any(|account| account.name == name) {
            return Err(AccountError::UnknownAccount(name.to_string()));
        }
        for account in &mut accounts {
            account.is_default = account.name == name;
        }
        self.save(&accounts)
    }

    fn save(&self, accounts: &[Account]) -> Result<(), AccountError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp_path = self.path.with_extension("tmp");
        let data = serde_json::to_string_pretty(accounts)?;
        fs::write(&tmp_path, &data)?;
        fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }
}
