//! External stores provisioners read from
//!
//! Only the boundary is defined here; implementations live with whoever owns
//! the data. Mocks are generated for tests and exported with `test-support`.

use std::collections::BTreeMap;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};

#[cfg(any(test, feature = "test-support"))]
use mockall::automock;

use kubews_common::Result;

/// Preference key: namespace the user's workspaces run in
pub const INFRASTRUCTURE_NAMESPACE_PREFERENCE: &str = "infrastructureNamespace";

/// Preference key: Unix seconds of the user's last workspace activity
pub const LAST_ACTIVITY_TIME_PREFERENCE: &str = "lastActivityTime";

/// Preference key: IDE preferences JSON holding the git identity
pub const USER_PREFERENCES_PREFERENCE: &str = "theia-user-preferences";

/// Per-user string preferences
#[cfg_attr(any(test, feature = "test-support"), automock)]
#[async_trait]
pub trait PreferenceStore: Send + Sync {
    /// All preferences of a user; empty when the user has none
    async fn find(&self, user_id: &str) -> Result<BTreeMap<String, String>>;
}

/// A user account
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    /// User id
    pub id: String,
    /// Login name
    pub name: String,
    /// Email address
    #[serde(default)]
    pub email: String,
}

/// One page of a user listing
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct UserPage {
    /// Users on this page
    pub items: Vec<User>,
    /// Whether another page follows
    pub has_next: bool,
}

/// Directory of user accounts
#[cfg_attr(any(test, feature = "test-support"), automock)]
#[async_trait]
pub trait UserDirectory: Send + Sync {
    /// Look up a user by id
    async fn get_by_id(&self, user_id: &str) -> Result<User>;

    /// List users, skipping `skip` and returning at most `max_items`
    async fn list(&self, skip: usize, max_items: usize) -> Result<UserPage>;
}

/// Stream every user, fetching one page at a time as the stream is consumed.
///
/// A page error is yielded once and ends the stream.
pub fn all_users(directory: &dyn UserDirectory, page_size: usize) -> BoxStream<'_, Result<User>> {
    let page_size = page_size.max(1);
    stream::unfold(Some(0usize), move |skip| async move {
        let skip = skip?;
        match directory.list(skip, page_size).await {
            Ok(page) => {
                let next = (page.has_next && !page.items.is_empty())
                    .then_some(skip + page.items.len());
                let items: Vec<Result<User>> = page.items.into_iter().map(Ok).collect();
                Some((stream::iter(items), next))
            }
            Err(e) => Some((stream::iter(vec![Err(e)]), None)),
        }
    })
    .flatten()
    .boxed()
}

/// An SSH key pair
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SshPair {
    /// Service the pair belongs to (`vcs`, `internal`, ...)
    pub service: String,
    /// Pair name, unique per service
    pub name: String,
    /// OpenSSH public key
    pub public_key: String,
    /// PEM private key, when stored
    #[serde(default)]
    pub private_key: Option<String>,
}

/// SSH key pairs per user and service
#[cfg_attr(any(test, feature = "test-support"), automock)]
#[async_trait]
pub trait SshKeyStore: Send + Sync {
    /// Pairs of `owner` for `service`
    async fn get_pairs(&self, owner: &str, service: &str) -> Result<Vec<SshPair>>;

    /// Generate and store a new pair
    async fn generate_pair(&self, owner: &str, service: &str, name: &str) -> Result<SshPair>;
}

/// Live workspace runtimes
#[cfg_attr(any(test, feature = "test-support"), automock)]
#[async_trait]
pub trait WorkspaceRuntimes: Send + Sync {
    /// Whether any workspace of the user is starting or stopping
    async fn has_in_progress(&self, user_id: &str) -> Result<bool>;
}
