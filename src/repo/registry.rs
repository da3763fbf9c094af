//! Process-wide mapping from local cache path to managed-repository handle
//! (`spec.md` §4.2). Insertion is atomic create-or-get: two concurrent
//! openers for the same path observe the same handle, and exactly one
//! performs on-disk initialization; readers racing with creation block on
//! the new handle's own write lock until initialization completes.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::error::Result;
use crate::repo::git::{GitCli, GitOps};
use crate::repo::ManagedRepository;

pub struct Registry<G: GitOps = GitCli> {
    git: Arc<G>,
    repos: Mutex<HashMap<PathBuf, Arc<ManagedRepository<G>>>>,
}

impl<G: GitOps> Registry<G> {
    pub fn new(git: Arc<G>) -> Self {
        Self {
            git,
            repos: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the handle for `local_path`, creating and initializing it on
    /// disk if this is the first request for it.
    pub async fn open_or_create(
        &self,
        local_path: PathBuf,
        upstream_url: String,
    ) -> Result<Arc<ManagedRepository<G>>> {
        let mut repos = self.repos.lock().await;

        match repos.entry(local_path.clone()) {
            Entry::Occupied(entry) => Ok(entry.get().clone()),
            Entry::Vacant(entry) => {
                let repo = Arc::new(ManagedRepository::new(
                    local_path.clone(),
                    upstream_url.clone(),
                    self.git.clone(),
                ));

                // Acquire the handle's own write lock *before* publishing it,
                // so any reader that races the creator on this path blocks
                // until initialization finishes, without blocking openers of
                // unrelated paths once we drop the registry-wide lock below.
                // `repo` stays alive for the rest of this scope, so borrowing
                // its lock here (rather than needing an owned guard) is fine.
                let init_guard = repo.rw().write().await;
                entry.insert(repo.clone());
                drop(repos);

                let init_result = self.git.init_mirror(&local_path, &upstream_url).await;
                drop(init_guard);
                init_result?;

                Ok(repo)
            }
        }
    }

    /// A snapshot of every currently-registered handle, safe to call while
    /// other tasks are concurrently inserting new ones.
    pub async fn all(&self) -> Vec<Arc<ManagedRepository<G>>> {
        self.repos.lock().await.values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;
    use crate::repo::git::MockGitOps;

    #[tokio::test]
    async fn concurrent_opens_of_same_path_init_exactly_once() {
        let cache = tempdir().unwrap().into_path();
        let mut git = MockGitOps::new();
        git.expect_init_mirror().times(1).returning(|_, _| Ok(()));
        let registry = Arc::new(Registry::new(Arc::new(git)));

        let path = cache.join("example.com/a/b");
        let mut handles = Vec::new();
        for _ in 0..10 {
            let registry = registry.clone();
            let path = path.clone();
            handles.push(tokio::spawn(async move {
                registry
                    .open_or_create(path, "https://example.com/a/b".into())
                    .await
                    .unwrap()
            }));
        }

        let mut repos = Vec::new();
        for h in handles {
            repos.push(h.await.unwrap());
        }
        for pair in repos.windows(2) {
            assert!(Arc::ptr_eq(&pair[0], &pair[1]));
        }
    }

    #[tokio::test]
    async fn distinct_paths_get_distinct_handles() {
        let cache = tempdir().unwrap().into_path();
        let mut git = MockGitOps::new();
        git.expect_init_mirror().times(2).returning(|_, _| Ok(()));
        let registry = Registry::new(Arc::new(git));

        let a = registry
            .open_or_create(cache.join("a"), "https://example.com/a".into())
            .await
            .unwrap();
        let b = registry
            .open_or_create(cache.join("b"), "https://example.com/b".into())
            .await
            .unwrap();
        assert!(!Arc::ptr_eq(&a, &b));
    }

    #[tokio::test]
    async fn all_reflects_every_inserted_handle() {
        let cache = tempdir().unwrap().into_path();
        let mut git = MockGitOps::new();
        git.expect_init_mirror().times(2).returning(|_, _| Ok(()));
        let registry = Registry::new(Arc::new(git));

        registry
            .open_or_create(cache.join("a"), "https://example.com/a".into())
            .await
            .unwrap();
        registry
            .open_or_create(cache.join("b"), "https://example.com/b".into())
            .await
            .unwrap();

        assert_eq!(registry.all().await.len(), 2);
    }
}
