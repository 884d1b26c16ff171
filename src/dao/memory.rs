use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::future::BoxFuture;
use time::OffsetDateTime;

use crate::dao::models::TeamEntity;
use crate::dao::storage::StorageResult;
use crate::dao::team_store::TeamStore;

/// In-process [`TeamStore`] used by tests and single-node deployments.
///
/// Keys are lowercased team names; entries never fail, matching the
/// fail-open contract of the registry.
#[derive(Debug, Clone, Default)]
pub struct InMemoryTeamStore {
    teams: Arc<DashMap<String, TeamEntity>>,
}

impl InMemoryTeamStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored teams.
    pub fn len(&self) -> usize {
        self.teams.len()
    }

    /// Whether the store holds no teams.
    pub fn is_empty(&self) -> bool {
        self.teams.is_empty()
    }
}

impl TeamStore for InMemoryTeamStore {
    fn load_team(&self, name: &str) -> BoxFuture<'static, StorageResult<Option<TeamEntity>>> {
        let entity = self.teams.get(&name.to_lowercase()).map(|e| e.clone());
        Box::pin(async move { Ok(entity) })
    }

    fn save_team(&self, team: TeamEntity) -> BoxFuture<'static, StorageResult<()>> {
        self.teams.insert(team.name.to_lowercase(), team);
        Box::pin(async move { Ok(()) })
    }

    fn delete_team(&self, name: &str) -> BoxFuture<'static, StorageResult<()>> {
        self.teams.remove(&name.to_lowercase());
        Box::pin(async move { Ok(()) })
    }

    fn list_team_names(&self) -> BoxFuture<'static, StorageResult<Vec<String>>> {
        let names = self.teams.iter().map(|e| e.value().name.clone()).collect();
        Box::pin(async move { Ok(names) })
    }

    fn delete_expired(&self, expiry: Duration) -> BoxFuture<'static, StorageResult<()>> {
        let cutoff = OffsetDateTime::now_utc() - expiry;
        self.teams.retain(|_, team| team.updated_at > cutoff);
        Box::pin(async move { Ok(()) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::estimation::Deck;
    use crate::state::team::Team;

    fn entity(name: &str) -> TeamEntity {
        let team = Team::new(name, "SM", Deck::standard()).unwrap();
        TeamEntity::from_team(&team)
    }

    #[tokio::test]
    async fn save_load_delete_are_case_insensitive() {
        let store = InMemoryTeamStore::new();
        store.save_team(entity("My Team")).await.unwrap();

        let loaded = store.load_team("my team").await.unwrap().unwrap();
        assert_eq!(loaded.name, "My Team");

        store.delete_team("MY TEAM").await.unwrap();
        assert!(store.load_team("My Team").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn delete_expired_keeps_fresh_teams() {
        let store = InMemoryTeamStore::new();
        let mut stale = entity("Stale");
        stale.updated_at = OffsetDateTime::now_utc() - Duration::from_secs(3_600);
        store.save_team(stale).await.unwrap();
        store.save_team(entity("Fresh")).await.unwrap();

        store
            .delete_expired(Duration::from_secs(1_200))
            .await
            .unwrap();

        let names = store.list_team_names().await.unwrap();
        assert_eq!(names, vec!["Fresh".to_string()]);
    }
}
