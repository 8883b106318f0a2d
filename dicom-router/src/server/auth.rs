//! HTTP Basic authentication against the configured users.

use std::collections::{BTreeSet, HashMap};

use axum::http::{HeaderMap, header};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;

use crate::config::UserConfig;

/// Role granting every permission.
pub const ADMIN_ROLE: &str = "admin";

/// An authenticated caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthUser {
    pub username: String,
    roles: BTreeSet<String>,
}

impl AuthUser {
    pub fn new(username: impl Into<String>, roles: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            username: username.into(),
            roles: roles.into_iter().map(Into::into).collect(),
        }
    }

    /// True if the user holds `role` or is an administrator.
    pub fn has_role(&self, role: &str) -> bool {
        self.roles.contains(role) || self.roles.contains(ADMIN_ROLE)
    }

    pub fn roles(&self) -> impl Iterator<Item = &str> {
        self.roles.iter().map(String::as_str)
    }
}

/// Credential store built from the `<Users>` configuration.
#[derive(Debug, Default)]
pub struct BasicAuth {
    users: HashMap<String, (String, AuthUser)>,
}

impl BasicAuth {
    pub fn new(users: &[UserConfig]) -> Self {
        let users = users
            .iter()
            .map(|u| {
                let user = AuthUser::new(&u.username, u.roles.iter().map(|r| r.trim().to_string()));
                (u.username.clone(), (u.password.clone(), user))
            })
            .collect();
        Self { users }
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }

    /// Check a username and password.
    pub fn verify(&self, username: &str, password: &str) -> Option<AuthUser> {
        let (expected, user) = self.users.get(username)?;
        (expected == password).then(|| user.clone())
    }

    /// Resolve the caller from an `Authorization: Basic ...` header.
    pub fn authenticate(&self, headers: &HeaderMap) -> Option<AuthUser> {
        let (username, password) = basic_credentials(headers)?;
        self.verify(&username, &password)
    }
}

/// Decode the username and password of a Basic `Authorization` header.
pub fn basic_credentials(headers: &HeaderMap) -> Option<(String, String)> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, encoded) = value.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("basic") {
        return None;
    }
    let decoded = STANDARD.decode(encoded.trim()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (username, password) = decoded.split_once(':')?;
    Some((username.to_string(), password.to_string()))
}
