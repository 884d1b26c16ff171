use std::time::Duration;

use futures::future::BoxFuture;

use crate::dao::models::TeamEntity;
use crate::dao::storage::StorageResult;

/// Abstraction over the persistence layer for estimation teams.
///
/// Names are matched case-insensitively by every implementation. Persistence
/// is best-effort for the registry: the in-memory aggregate stays
/// authoritative for the node's uptime, and load failures are treated as
/// not-found by the caller.
pub trait TeamStore: Send + Sync {
    fn load_team(&self, name: &str) -> BoxFuture<'static, StorageResult<Option<TeamEntity>>>;
    fn save_team(&self, team: TeamEntity) -> BoxFuture<'static, StorageResult<()>>;
    fn delete_team(&self, name: &str) -> BoxFuture<'static, StorageResult<()>>;
    fn list_team_names(&self) -> BoxFuture<'static, StorageResult<Vec<String>>>;
    fn delete_expired(&self, expiry: Duration) -> BoxFuture<'static, StorageResult<()>>;
}
