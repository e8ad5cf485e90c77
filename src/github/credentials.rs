//! Resolving the access token used to sync a project.
//!
//! Tokens belong to the project owner's linked GitHub account. Acquiring and
//! encrypting them is the OAuth subsystem's job; here they are only read.

use async_trait::async_trait;
use thiserror::Error;

use super::client::AccessToken;
use crate::store::{Store, StoreError};
use crate::types::{Project, ProjectId};

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("project {0} has no owning user")]
    NoOwner(ProjectId),

    #[error("owner of project {0} has no linked GitHub account")]
    NotLinked(ProjectId),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Supplies the token for API calls made on behalf of a project.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn token_for(&self, project: &Project) -> Result<AccessToken, CredentialError>;
}

/// Reads the owner's token from the `linked_accounts` table.
#[derive(Debug, Clone)]
pub struct LinkedAccountCredentials {
    store: Store,
}

impl LinkedAccountCredentials {
    pub fn new(store: Store) -> Self {
        Self { store }
    }
}

#[async_trait]
impl CredentialProvider for LinkedAccountCredentials {
    async fn token_for(&self, project: &Project) -> Result<AccessToken, CredentialError> {
        let owner = project.owner_user_id.ok_or(CredentialError::NoOwner(project.id))?;
        let token = self
            .store
            .access_token_for_user(owner)
            .await?
            .filter(|t| !t.trim().is_empty())
            .ok_or(CredentialError::NotLinked(project.id))?;
        Ok(AccessToken::new(token))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::test_support::{project, temp_store};

    #[tokio::test]
    async fn resolves_owner_token() {
        let (store, _dir) = temp_store();
        let p = project(&store, "acme/widgets").await;
        store
            .link_account(p.owner_user_id.unwrap(), "octocat", "gho_abc")
            .await
            .unwrap();

        let creds = LinkedAccountCredentials::new(store);
        let token = creds.token_for(&p).await.unwrap();
        assert_eq!(token.expose(), "gho_abc");
    }

    #[tokio::test]
    async fn unlinked_owner_is_an_error() {
        let (store, _dir) = temp_store();
        let p = project(&store, "acme/widgets").await;

        let creds = LinkedAccountCredentials::new(store);
        assert!(matches!(
            creds.token_for(&p).await,
            Err(CredentialError::NotLinked(id)) if id == p.id
        ));
    }

    #[tokio::test]
    async fn ownerless_project_is_an_error() {
        let (store, _dir) = temp_store();
        let mut p = project(&store, "acme/widgets").await;
        p.owner_user_id = None;

        let creds = LinkedAccountCredentials::new(store);
        assert!(matches!(
            creds.token_for(&p).await,
            Err(CredentialError::NoOwner(_))
        ));
    }
}
