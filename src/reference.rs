//! Package references
//!
//! A reference identifies one package: `name/version@user/channel`.
//! The `@user/channel` part is optional on input and filled from
//! [`ReferenceDefaults`]; the canonical (displayed) form always carries it.
//!
//! ```text
//! boost/1.69.0@conan/stable     // fully qualified
//! hdf5/1.10.5                   // user/channel from defaults
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Error produced when a reference string does not follow the grammar.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("malformed reference '{input}': {reason}")]
pub struct ReferenceError {
    pub input: String,
    pub reason: String,
}

impl ReferenceError {
    fn new(input: &str, reason: impl Into<String>) -> Self {
        Self {
            input: input.to_string(),
            reason: reason.into(),
        }
    }
}

/// Fallback namespace applied to references written as `name/version`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferenceDefaults {
    pub user: String,
    pub channel: String,
}

impl Default for ReferenceDefaults {
    fn default() -> Self {
        Self {
            user: "_".to_string(),
            channel: "_".to_string(),
        }
    }
}

/// A fully qualified package identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RequirementRef {
    name: String,
    version: String,
    user: String,
    channel: String,
}

impl RequirementRef {
    /// Build a reference from its parts, validating each one.
    pub fn new(
        name: impl Into<String>,
        version: impl Into<String>,
        user: impl Into<String>,
        channel: impl Into<String>,
    ) -> Result<Self, ReferenceError> {
        let reference = Self {
            name: name.into(),
            version: version.into(),
            user: user.into(),
            channel: channel.into(),
        };
        let display = reference.to_string();
        for (field, value) in [
            ("name", &reference.name),
            ("version", &reference.version),
            ("user", &reference.user),
            ("channel", &reference.channel),
        ] {
            check_component(&display, field, value)?;
        }
        Ok(reference)
    }

    /// Parse `name/version@user/channel` or `name/version`.
    pub fn parse(input: &str, defaults: &ReferenceDefaults) -> Result<Self, ReferenceError> {
        let (coordinates, namespace) = match input.split_once('@') {
            Some((coords, ns)) => {
                if ns.contains('@') {
                    return Err(ReferenceError::new(input, "multiple '@' separators"));
                }
                (coords, Some(ns))
            }
            None => (input, None),
        };

        let (name, version) = split_pair(input, coordinates, "name/version")?;
        check_component(input, "name", name)?;
        check_component(input, "version", version)?;

        let (user, channel) = match namespace {
            Some(ns) => {
                let (user, channel) = split_pair(input, ns, "user/channel")?;
                check_component(input, "user", user)?;
                check_component(input, "channel", channel)?;
                (user.to_string(), channel.to_string())
            }
            None => (defaults.user.clone(), defaults.channel.clone()),
        };

        Ok(Self {
            name: name.to_string(),
            version: version.to_string(),
            user,
            channel,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// `name@user/channel`: the identity minus the version.
    ///
    /// Two references sharing a package key but not a version conflict.
    pub fn package_key(&self) -> String {
        format!("{}@{}/{}", self.name, self.user, self.channel)
    }

    /// Relative directory used by on-disk layouts: `name/version/user/channel`.
    pub fn path_segments(&self) -> [&str; 4] {
        [&self.name, &self.version, &self.user, &self.channel]
    }
}

fn split_pair<'a>(
    input: &str,
    part: &'a str,
    expected: &str,
) -> Result<(&'a str, &'a str), ReferenceError> {
    let (left, right) = part
        .split_once('/')
        .ok_or_else(|| ReferenceError::new(input, format!("expected '{}'", expected)))?;
    if right.contains('/') {
        return Err(ReferenceError::new(
            input,
            format!("too many '/' separators in '{}'", part),
        ));
    }
    Ok((left, right))
}

fn check_component(input: &str, field: &str, value: &str) -> Result<(), ReferenceError> {
    if value.is_empty() {
        return Err(ReferenceError::new(input, format!("{} is empty", field)));
    }
    if value.chars().any(|c| c.is_whitespace() || c == '/' || c == '@') {
        return Err(ReferenceError::new(
            input,
            format!("{} '{}' contains an invalid character", field, value),
        ));
    }
    Ok(())
}

impl fmt::Display for RequirementRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}@{}/{}",
            self.name, self.version, self.user, self.channel
        )
    }
}

/// Strict parse: only the canonical form is accepted, no defaults applied.
impl FromStr for RequirementRef {
    type Err = ReferenceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if !s.contains('@') {
            return Err(ReferenceError::new(s, "expected 'name/version@user/channel'"));
        }
        Self::parse(s, &ReferenceDefaults::default())
    }
}

impl TryFrom<String> for RequirementRef {
    type Error = ReferenceError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<RequirementRef> for String {
    fn from(value: RequirementRef) -> Self {
        value.to_string()
    }
}
