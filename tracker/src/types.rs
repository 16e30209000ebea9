use chrono::{DateTime, NaiveDate, SecondsFormat, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Whether a repository lives under the individual account or the organization
/// configured on the credential. Serialized with the historical `user`/`org` names.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum OwnerKind {
    #[default]
    #[serde(rename = "user")]
    Individual,
    #[serde(rename = "org")]
    Organization,
}

impl OwnerKind {
    pub const fn as_str(&self) -> &'static str {
        match self {
            OwnerKind::Individual => "user",
            OwnerKind::Organization => "org",
        }
    }

    /// Unknown values are treated as individual ownership, which is what older
    /// rows without an owner type meant.
    pub fn from_stored(s: &str) -> Self {
        match s {
            "org" => OwnerKind::Organization,
            _ => OwnerKind::Individual,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct TrackedRepository {
    pub repository_id: String,
    pub owner_kind: OwnerKind,
    pub active: bool,
    pub added_at: DateTime<Utc>,
    pub last_sync_at: Option<DateTime<Utc>>,
    /// None in single-operator mode.
    pub owning_user_id: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct StarSnapshot {
    pub repository_id: String,
    pub star_count: u32,
    pub observed_at: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct KindTotals {
    pub count: u64,
    pub uniques: u64,
}

impl KindTotals {
    pub fn add(&mut self, count: u64, uniques: u64) {
        self.count += count;
        self.uniques += uniques;
    }
}

/// Derived view over stored records; recomputed on every read.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct RepositorySummary {
    pub repository_id: String,
    pub clones: KindTotals,
    pub views: KindTotals,
    pub recent_clones: KindTotals,
    pub recent_views: KindTotals,
    pub star_count: Option<u32>,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub first_collected: Option<NaiveDate>,
}

#[derive(thiserror::Error, Clone, Debug, PartialEq, Eq)]
pub enum CredentialError {
    #[error("no upstream identity configured")]
    MissingIdentity,
    #[error("no upstream token configured")]
    MissingToken,
}

/// Upstream credential, resolved once by whoever owns authentication and passed
/// in as a plain value.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    /// Individual account name used to build `owner/name` paths.
    pub identity: String,
    pub token: String,
    pub organization: Option<String>,
    /// Owning user in multi-user mode; None for the single operator.
    pub scope_id: Option<String>,
}

impl Credential {
    pub fn new<I, T>(identity: I, token: T) -> Self
    where
        I: Into<String>,
        T: Into<String>,
    {
        Credential {
            identity: identity.into(),
            token: token.into(),
            organization: None,
            scope_id: None,
        }
    }

    pub fn with_organization(mut self, organization: impl Into<String>) -> Self {
        self.organization = Some(organization.into());
        self
    }

    pub fn with_scope(mut self, scope_id: impl Into<String>) -> Self {
        self.scope_id = Some(scope_id.into());
        self
    }

    pub fn scope(&self) -> Option<&str> {
        self.scope_id.as_deref()
    }

    pub fn validate(&self) -> Result<(), CredentialError> {
        if self.identity.trim().is_empty() {
            return Err(CredentialError::MissingIdentity);
        }
        if self.token.trim().is_empty() {
            return Err(CredentialError::MissingToken);
        }
        Ok(())
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("identity", &self.identity)
            .field("token", &"<redacted>")
            .field("organization", &self.organization)
            .field("scope_id", &self.scope_id)
            .finish()
    }
}

/// Current time at the precision timestamps are persisted with, so values
/// survive a round trip through either backend unchanged.
pub fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(0)
}

pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, true)
}

pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|ts| ts.to_utc().trunc_subsecs(0))
}
