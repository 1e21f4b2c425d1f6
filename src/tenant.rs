//! School scoping over the collection store
//!
//! Every record a `SchoolScope` hands out carries its school's id; records
//! owned by other schools behave as if they did not exist.

use serde_json::Value;
use std::sync::Arc;

use crate::error::{PortalError, Result};
use crate::storage::{is_visible, PortalStore, Record, RecordStatus, Subscription};

/// Field naming the owning school
pub const SCHOOL_FIELD: &str = "schoolId";

pub fn school_of(record: &Record) -> Option<&str> {
    record.get(SCHOOL_FIELD).and_then(|s| s.as_str())
}

/// Keep only the records owned by `school_id`
pub fn filter_school(records: Vec<Record>, school_id: &str) -> Vec<Record> {
    records
        .into_iter()
        .filter(|r| school_of(r) == Some(school_id))
        .collect()
}

#[derive(Clone)]
pub struct SchoolScope {
    store: Arc<PortalStore>,
    school_id: String,
}

impl SchoolScope {
    pub fn new(store: Arc<PortalStore>, school_id: impl Into<String>) -> Self {
        Self {
            store,
            school_id: school_id.into(),
        }
    }

    pub fn school_id(&self) -> &str {
        &self.school_id
    }

    pub fn owns(&self, record: &Record) -> bool {
        school_of(record) == Some(self.school_id.as_str())
    }

    pub fn get(&self, collection: &str) -> Result<Vec<Record>> {
        Ok(filter_school(self.store.get(collection)?, &self.school_id))
    }

    /// Records visible to the public (published or status-less)
    pub fn published(&self, collection: &str) -> Result<Vec<Record>> {
        Ok(self
            .get(collection)?
            .into_iter()
            .filter(is_visible)
            .collect())
    }

    pub fn get_item(&self, collection: &str, id: &str) -> Result<Option<Record>> {
        Ok(self
            .store
            .get_item(collection, id)?
            .filter(|r| self.owns(r)))
    }

    /// Insert a record owned by this school
    pub fn insert(&self, collection: &str, data: Value) -> Result<Record> {
        let mut data = data;
        let Some(fields) = data.as_object_mut() else {
            return Err(PortalError::InvalidRecord("expected a JSON object".to_string()));
        };
        self.check_school_field(fields)?;
        fields.insert(SCHOOL_FIELD.to_string(), Value::String(self.school_id.clone()));
        self.store.insert(collection, data)
    }

    /// Update a record of this school; foreign records are not found
    pub fn update(&self, collection: &str, id: &str, partial: Value) -> Result<Record> {
        if let Some(fields) = partial.as_object() {
            self.check_school_field(fields)?;
        }
        if self.get_item(collection, id)?.is_none() {
            return Err(PortalError::not_found(collection, id));
        }
        self.store.update(collection, id, partial)
    }

    /// Delete a record of this school. Foreign records are left alone.
    pub fn delete(&self, collection: &str, id: &str) -> Result<bool> {
        if self.get_item(collection, id)?.is_none() {
            return Ok(false);
        }
        self.store.delete(collection, id)
    }

    /// Move a record to `status` (draft→published, open→closed, pending→paid, ...)
    pub fn set_status(&self, collection: &str, id: &str, status: RecordStatus) -> Result<Record> {
        self.update(collection, id, serde_json::json!({ "status": status }))
    }

    pub fn subscribe(&self, collection: &str) -> Result<SchoolSubscription> {
        Ok(SchoolSubscription {
            inner: self.store.subscribe(collection)?,
            school_id: self.school_id.clone(),
        })
    }

    fn check_school_field(&self, fields: &Record) -> Result<()> {
        match fields.get(SCHOOL_FIELD) {
            None => Ok(()),
            Some(Value::String(s)) if *s == self.school_id => Ok(()),
            Some(_) => Err(PortalError::InvalidRecord(format!(
                "{} cannot be reassigned",
                SCHOOL_FIELD
            ))),
        }
    }
}

/// Collection snapshots filtered to one school
pub struct SchoolSubscription {
    inner: Subscription,
    school_id: String,
}

impl SchoolSubscription {
    pub fn collection(&self) -> &str {
        self.inner.collection()
    }

    pub async fn recv(&mut self) -> Option<Vec<Record>> {
        let snapshot = self.inner.recv().await?;
        Some(filter_school(snapshot, &self.school_id))
    }

    pub fn unsubscribe(self) {
        self.inner.unsubscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::record_id;
    use serde_json::json;
    use std::time::Duration;
    use tempfile::TempDir;

    fn setup() -> anyhow::Result<(TempDir, Arc<PortalStore>)> {
        let temp_dir = TempDir::new()?;
        let store = Arc::new(PortalStore::new(temp_dir.path().join("db"))?);
        Ok((temp_dir, store))
    }

    #[test]
    fn test_get_only_returns_own_school() -> anyhow::Result<()> {
        let (_tmp, store) = setup()?;
        let green = SchoolScope::new(Arc::clone(&store), "green");
        let hill = SchoolScope::new(Arc::clone(&store), "hill");

        green.insert("news", json!({"title": "Green news"}))?;
        hill.insert("news", json!({"title": "Hill news"}))?;
        store.insert("news", json!({"title": "Unowned"}))?;

        let records = green.get("news")?;
        assert_eq!(records.len(), 1);
        assert!(records.iter().all(|r| school_of(r) == Some("green")));
        Ok(())
    }

    #[test]
    fn test_foreign_records_are_hidden() -> anyhow::Result<()> {
        let (_tmp, store) = setup()?;
        let green = SchoolScope::new(Arc::clone(&store), "green");
        let hill = SchoolScope::new(Arc::clone(&store), "hill");

        let record = hill.insert("fees", json!({"amount": 100}))?;
        let id = record_id(&record).unwrap();

        assert!(green.get_item("fees", id)?.is_none());
        assert!(green.update("fees", id, json!({"amount": 0})).unwrap_err().is_not_found());
        assert!(!green.delete("fees", id)?);
        assert_eq!(hill.get_item("fees", id)?.unwrap()["amount"], json!(100));
        Ok(())
    }

    #[test]
    fn test_school_cannot_be_reassigned() -> anyhow::Result<()> {
        let (_tmp, store) = setup()?;
        let green = SchoolScope::new(Arc::clone(&store), "green");

        let err = green
            .insert("news", json!({"schoolId": "hill"}))
            .unwrap_err();
        assert!(matches!(err, PortalError::InvalidRecord(_)));

        let record = green.insert("news", json!({"id": "n1"}))?;
        assert_eq!(school_of(&record), Some("green"));
        let err = green
            .update("news", "n1", json!({"schoolId": "hill"}))
            .unwrap_err();
        assert!(matches!(err, PortalError::InvalidRecord(_)));
        Ok(())
    }

    #[test]
    fn test_published_and_status_transitions() -> anyhow::Result<()> {
        let (_tmp, store) = setup()?;
        let green = SchoolScope::new(store, "green");

        green.insert("events", json!({"id": "e1", "status": "draft"}))?;
        green.insert("events", json!({"id": "e2"}))?;
        assert_eq!(green.published("events")?.len(), 1);

        let record = green.set_status("events", "e1", RecordStatus::Published)?;
        assert_eq!(record["status"], json!("published"));
        assert_eq!(green.published("events")?.len(), 2);

        green.set_status("events", "e1", RecordStatus::Archived)?;
        assert_eq!(green.published("events")?.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_subscription_is_filtered() -> anyhow::Result<()> {
        let (_tmp, store) = setup()?;
        let green = SchoolScope::new(Arc::clone(&store), "green");
        let hill = SchoolScope::new(Arc::clone(&store), "hill");

        let mut sub = green.subscribe("news")?;
        assert!(sub.recv().await.unwrap().is_empty());

        hill.insert("news", json!({"title": "Hill"}))?;
        let snapshot = tokio::time::timeout(Duration::from_secs(1), sub.recv())
            .await?
            .unwrap();
        assert!(snapshot.is_empty());

        green.insert("news", json!({"title": "Green"}))?;
        let snapshot = tokio::time::timeout(Duration::from_secs(1), sub.recv())
            .await?
            .unwrap();
        assert_eq!(snapshot.len(), 1);
        Ok(())
    }
}
