use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use super::{BlockingIdentityResolver, Credentials, IdentityError, IdentityResolver, SigningIdentity};
use crate::context::ExecutionAttributes;

const PROVIDER: &str = "profile";
const DEFAULT_PROFILE: &str = "default";

type Lookup = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// Reads static keys for one profile of the shared credentials file.
///
/// The file is `AWS_SHARED_CREDENTIALS_FILE` when set, otherwise
/// `~/.aws/credentials`; the profile is `AWS_PROFILE` or `default`. The file is
/// read on every resolve, so wrap the resolver in
/// [`CachingIdentityResolver`](super::CachingIdentityResolver) for hot paths.
#[derive(Clone)]
pub struct ProfileIdentityResolver {
    lookup: Lookup,
    path: Option<PathBuf>,
    profile: Option<String>,
}

impl ProfileIdentityResolver {
    pub fn new() -> Self {
        Self::with_lookup(|name| std::env::var(name).ok())
    }

    /// Reads `AWS_*` and home-directory variables through `lookup`.
    pub fn with_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String> + Send + Sync + 'static,
    {
        Self {
            lookup: Arc::new(lookup),
            path: None,
            profile: None,
        }
    }

    /// Reads this file instead of the one named by the environment.
    pub fn path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// Uses this profile instead of `AWS_PROFILE`.
    pub fn profile(mut self, profile: impl Into<String>) -> Self {
        self.profile = Some(profile.into());
        self
    }

    fn var(&self, name: &str) -> Option<String> {
        (self.lookup)(name).filter(|value| !value.trim().is_empty())
    }

    fn profile_name(&self) -> String {
        self.profile
            .clone()
            .or_else(|| self.var("AWS_PROFILE"))
            .unwrap_or_else(|| DEFAULT_PROFILE.to_owned())
    }

    fn credentials_path(&self) -> Result<PathBuf, IdentityError> {
        if let Some(path) = &self.path {
            return Ok(path.clone());
        }
        if let Some(path) = self.var("AWS_SHARED_CREDENTIALS_FILE") {
            return Ok(expand_home(&path, self.home()));
        }
        let home = self.home().ok_or_else(|| IdentityError::Missing {
            provider: PROVIDER,
            message: "no home directory to locate .aws/credentials".to_owned(),
        })?;
        Ok(PathBuf::from(home).join(".aws").join("credentials"))
    }

    fn home(&self) -> Option<String> {
        self.var("HOME").or_else(|| self.var("USERPROFILE"))
    }

    fn load(&self) -> Result<SigningIdentity, IdentityError> {
        let path = self.credentials_path()?;
        let profile = self.profile_name();
        let contents = std::fs::read_to_string(&path).map_err(|error| IdentityError::Missing {
            provider: PROVIDER,
            message: format!("cannot read {}: {error}", path.display()),
        })?;
        debug!(path = %path.display(), profile = %profile, "loading profile credentials");
        parse_credentials(&contents, &profile).map(SigningIdentity::from)
    }
}

impl Default for ProfileIdentityResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ProfileIdentityResolver {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("ProfileIdentityResolver")
            .field("path", &self.path)
            .field("profile", &self.profile)
            .finish()
    }
}

fn expand_home(path: &str, home: Option<String>) -> PathBuf {
    match (path.strip_prefix("~/"), home) {
        (Some(rest), Some(home)) => PathBuf::from(home).join(rest),
        _ => PathBuf::from(path),
    }
}

/// Pulls one profile's keys out of credentials-file text.
fn parse_credentials(contents: &str, profile: &str) -> Result<Credentials, IdentityError> {
    let mut found = false;
    let mut in_profile = false;
    let mut access_key_id = None;
    let mut secret_access_key = None;
    let mut session_token = None;

    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        if let Some(section) = line.strip_prefix('[').and_then(|rest| rest.strip_suffix(']')) {
            in_profile = section.trim() == profile;
            found |= in_profile;
            continue;
        }
        if !in_profile {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let value = value.trim();
        if value.is_empty() {
            continue;
        }
        match key.trim().to_ascii_lowercase().as_str() {
            "aws_access_key_id" => access_key_id = Some(value.to_owned()),
            "aws_secret_access_key" => secret_access_key = Some(value.to_owned()),
            "aws_session_token" => session_token = Some(value.to_owned()),
            _ => {}
        }
    }

    let missing = |message: String| IdentityError::Missing {
        provider: PROVIDER,
        message,
    };
    if !found {
        return Err(missing(format!("profile `{profile}` not found")));
    }
    let access_key_id =
        access_key_id.ok_or_else(|| missing(format!("profile `{profile}` has no aws_access_key_id")))?;
    let secret_access_key = secret_access_key
        .ok_or_else(|| missing(format!("profile `{profile}` has no aws_secret_access_key")))?;

    let mut credentials = Credentials::new(access_key_id, secret_access_key);
    if let Some(session_token) = session_token {
        credentials = credentials.session_token(session_token);
    }
    Ok(credentials)
}

#[async_trait]
impl IdentityResolver for ProfileIdentityResolver {
    async fn resolve(&self, _attributes: &ExecutionAttributes) -> Result<SigningIdentity, IdentityError> {
        self.load()
    }

    fn name(&self) -> &'static str {
        PROVIDER
    }
}

impl BlockingIdentityResolver for ProfileIdentityResolver {
    fn resolve(&self, _attributes: &ExecutionAttributes) -> Result<SigningIdentity, IdentityError> {
        self.load()
    }

    fn name(&self) -> &'static str {
        PROVIDER
    }
}
