use std::collections::BTreeMap;

use tokio::sync::RwLock;

use super::{BoxFuture, Medium, MediumError};

/// In-process table. Every call takes the single table lock.
#[derive(Debug, Default)]
pub struct MemoryMedium {
    table: RwLock<BTreeMap<String, String>>,
}

impl MemoryMedium {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.table.read().await.len()
    }
}

impl Medium for MemoryMedium {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn ping(&self) -> BoxFuture<'_, Result<(), MediumError>> {
        Box::pin(async { Ok(()) })
    }

    fn put<'a>(&'a self, key: &'a str, document: String) -> BoxFuture<'a, Result<(), MediumError>> {
        Box::pin(async move {
            self.table.write().await.insert(key.to_string(), document);
            Ok(())
        })
    }

    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<String, MediumError>> {
        Box::pin(async move {
            self.table
                .read()
                .await
                .get(key)
                .cloned()
                .ok_or_else(|| MediumError::NotFound {
                    key: key.to_string(),
                })
        })
    }

    fn delete_one<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<(), MediumError>> {
        Box::pin(async move {
            match self.table.write().await.remove(key) {
                Some(_) => Ok(()),
                None => Err(MediumError::NotFound {
                    key: key.to_string(),
                }),
            }
        })
    }

    fn delete_many<'a>(&'a self, keys: &'a [String]) -> BoxFuture<'a, Result<u64, MediumError>> {
        Box::pin(async move {
            if keys.is_empty() {
                return Ok(0);
            }
            let mut table = self.table.write().await;
            let removed = keys.iter().filter(|k| table.remove(*k).is_some()).count();
            Ok(removed as u64)
        })
    }

    fn list_keys<'a>(&'a self, prefix: &'a str) -> BoxFuture<'a, Result<Vec<String>, MediumError>> {
        Box::pin(async move {
            let table = self.table.read().await;
            Ok(table
                .range(prefix.to_string()..)
                .take_while(|(k, _)| k.starts_with(prefix))
                .map(|(k, _)| k.clone())
                .collect())
        })
    }
}
