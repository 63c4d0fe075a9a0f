//! In-memory repository implementations.
//!
//! Used by tests and by local runs without PostgreSQL. Semantics follow the
//! SQL repositories: claims are atomic and spatial queries use
//! [`PeakIndex`].

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use nsweb_core::{
    Claim, Decoding, DecodingIdentity, DecodingRepository, DecodingSet, DecodingSetRepository,
    DecodingStatus, Error, Image, ImageRepository, Peak, PeakIndex, PeakRepository, Result, Study,
    StudyPeakCount,
};

#[derive(Default)]
struct Inner {
    next_id: i64,
    /// id → (decoding_set_id, decoding)
    decodings: BTreeMap<i64, (i64, Decoding)>,
    keys: HashMap<(String, i64), i64>,
    sets: Vec<DecodingSet>,
    peaks: PeakIndex,
    images: BTreeMap<i64, Image>,
    locations: HashMap<(i32, i32, i32), Vec<i64>>,
}

/// Thread-safe in-memory store implementing every repository trait.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed reference sets.
    pub fn with_decoding_sets(self, sets: Vec<DecodingSet>) -> Self {
        if let Ok(mut inner) = self.inner.lock() {
            inner.sets = sets;
        }
        self
    }

    /// Seed studies and their peaks.
    pub fn with_literature(self, studies: Vec<Study>, peaks: Vec<Peak>) -> Self {
        if let Ok(mut inner) = self.inner.lock() {
            inner.peaks = PeakIndex::new(peaks, studies);
        }
        self
    }

    /// Seed internal images.
    pub fn with_images(self, images: Vec<Image>) -> Self {
        if let Ok(mut inner) = self.inner.lock() {
            inner.images = images.into_iter().map(|i| (i.id, i)).collect();
        }
        self
    }

    /// Attach an image to an integer grid location.
    pub fn with_location_image(self, x: i32, y: i32, z: i32, image_id: i64) -> Self {
        if let Ok(mut inner) = self.inner.lock() {
            inner.locations.entry((x, y, z)).or_default().push(image_id);
        }
        self
    }

    /// Number of stored decodings.
    pub fn decoding_count(&self) -> usize {
        self.inner.lock().map(|i| i.decodings.len()).unwrap_or(0)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| Error::Internal("memory store lock poisoned".to_string()))
    }
}

#[async_trait]
impl DecodingRepository for MemoryStore {
    async fn find(&self, identity: &DecodingIdentity, set_id: i64) -> Result<Option<Decoding>> {
        let inner = self.lock()?;
        Ok(inner
            .keys
            .get(&(identity.key(), set_id))
            .and_then(|id| inner.decodings.get(id))
            .map(|(_, d)| d.clone()))
    }

    async fn claim(&self, req: nsweb_core::NewDecoding) -> Result<Claim> {
        let mut inner = self.lock()?;
        let key = (req.identity.key(), req.decoding_set.id);

        if let Some((_, existing)) = inner.keys.get(&key).and_then(|id| inner.decodings.get(id)) {
            return Ok(Claim::Existing(existing.clone()));
        }
        if inner.decodings.values().any(|(_, d)| d.uuid == req.uuid) {
            return Err(Error::Internal(format!("duplicate decoding uuid {}", req.uuid)));
        }

        inner.next_id += 1;
        let id = inner.next_id;
        let decoding = Decoding {
            id,
            uuid: req.uuid,
            identity: req.identity,
            decoding_set: req.decoding_set.name.clone(),
            name: req.name,
            display: req.display,
            download: req.download,
            ip: req.ip,
            image_modified_at: req.image_modified_at,
            image_decoded_at: None,
            filename: req.filename,
            status: DecodingStatus::Pending,
            error_message: None,
            created_at: Utc::now(),
        };
        inner.keys.insert(key, id);
        inner
            .decodings
            .insert(id, (req.decoding_set.id, decoding.clone()));
        Ok(Claim::Created(decoding))
    }

    async fn get_by_uuid(&self, uuid: &str) -> Result<Option<Decoding>> {
        let inner = self.lock()?;
        Ok(inner
            .decodings
            .values()
            .find(|(_, d)| d.uuid == uuid)
            .map(|(_, d)| d.clone()))
    }

    async fn delete(&self, id: i64) -> Result<bool> {
        let mut inner = self.lock()?;
        match inner.decodings.remove(&id) {
            Some((set_id, d)) => {
                inner.keys.remove(&(d.identity.key(), set_id));
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn mark_complete(&self, id: i64, decoded_at: DateTime<Utc>) -> Result<()> {
        let mut inner = self.lock()?;
        let (_, d) = inner
            .decodings
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("decoding {}", id)))?;
        d.status = DecodingStatus::Complete;
        d.image_decoded_at = Some(decoded_at);
        d.error_message = None;
        Ok(())
    }

    async fn mark_failed(&self, id: i64, message: &str) -> Result<()> {
        let mut inner = self.lock()?;
        let (_, d) = inner
            .decodings
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("decoding {}", id)))?;
        d.status = DecodingStatus::Failed;
        d.image_decoded_at = None;
        d.error_message = Some(message.to_string());
        Ok(())
    }

    async fn set_filename(&self, id: i64, filename: &str) -> Result<()> {
        let mut inner = self.lock()?;
        if let Some((_, d)) = inner.decodings.get_mut(&id) {
            d.filename = filename.to_string();
        }
        Ok(())
    }
}

#[async_trait]
impl DecodingSetRepository for MemoryStore {
    async fn list(&self) -> Result<Vec<DecodingSet>> {
        let mut sets = self.lock()?.sets.clone();
        sets.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(sets)
    }

    async fn get_by_name(&self, name: &str) -> Result<Option<DecodingSet>> {
        Ok(self.lock()?.sets.iter().find(|s| s.name == name).cloned())
    }
}

#[async_trait]
impl PeakRepository for MemoryStore {
    async fn find_nearby(
        &self,
        x: f64,
        y: f64,
        z: f64,
        radius: f64,
    ) -> Result<Vec<StudyPeakCount>> {
        self.lock()?.peaks.find_nearby(x, y, z, radius)
    }
}

#[async_trait]
impl ImageRepository for MemoryStore {
    async fn get(&self, id: i64) -> Result<Option<Image>> {
        Ok(self.lock()?.images.get(&id).cloned())
    }

    async fn images_at_location(&self, x: i32, y: i32, z: i32) -> Result<Vec<Image>> {
        let inner = self.lock()?;
        let mut images: Vec<Image> = inner
            .locations
            .get(&(x, y, z))
            .into_iter()
            .flatten()
            .filter_map(|id| inner.images.get(id))
            .filter(|i| i.display)
            .cloned()
            .collect();
        images.sort_by_key(|i| i.id);
        Ok(images)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nsweb_core::NewDecoding;

    fn terms() -> DecodingSet {
        DecodingSet {
            id: 1,
            name: "terms_20k".into(),
            description: None,
            n_images: 3,
        }
    }

    fn new_decoding(uuid: &str, identity: DecodingIdentity) -> NewDecoding {
        NewDecoding {
            uuid: uuid.into(),
            identity,
            decoding_set: terms(),
            name: "map.nii.gz".into(),
            display: true,
            download: false,
            ip: None,
            image_modified_at: None,
            filename: format!("/tmp/{}.nii.gz", uuid),
        }
    }

    #[tokio::test]
    async fn test_claim_is_insert_if_absent() {
        let store = MemoryStore::new().with_decoding_sets(vec![terms()]);
        let identity = DecodingIdentity::Url("http://a.org/x.nii.gz".into());

        let first = store.claim(new_decoding(&"a".repeat(32), identity.clone())).await.unwrap();
        let second = store.claim(new_decoding(&"b".repeat(32), identity.clone())).await.unwrap();

        assert!(matches!(first, Claim::Created(_)));
        match second {
            Claim::Existing(d) => assert_eq!(d.uuid, "a".repeat(32)),
            Claim::Created(_) => panic!("second claim must see the first row"),
        }
        assert_eq!(store.decoding_count(), 1);
    }

    #[tokio::test]
    async fn test_status_transitions() {
        let store = MemoryStore::new();
        let d = store
            .claim(new_decoding(&"c".repeat(32), DecodingIdentity::Image(4)))
            .await
            .unwrap()
            .into_decoding();
        assert_eq!(d.status, DecodingStatus::Pending);

        store.mark_failed(d.id, "boom").await.unwrap();
        let failed = store.get_by_uuid(&d.uuid).await.unwrap().unwrap();
        assert_eq!(failed.status, DecodingStatus::Failed);
        assert_eq!(failed.error_message.as_deref(), Some("boom"));

        store.mark_complete(d.id, Utc::now()).await.unwrap();
        let done = store.find(&DecodingIdentity::Image(4), 1).await.unwrap().unwrap();
        assert!(done.is_complete());
        assert!(done.error_message.is_none());
    }

    #[tokio::test]
    async fn test_delete_frees_identity() {
        let store = MemoryStore::new();
        let identity = DecodingIdentity::NeuroVault(9);
        let d = store
            .claim(new_decoding(&"d".repeat(32), identity.clone()))
            .await
            .unwrap()
            .into_decoding();

        assert!(store.delete(d.id).await.unwrap());
        assert!(!store.delete(d.id).await.unwrap());
        assert!(store.find(&identity, 1).await.unwrap().is_none());

        let again = store.claim(new_decoding(&"e".repeat(32), identity)).await.unwrap();
        assert!(matches!(again, Claim::Created(_)));
    }

    #[tokio::test]
    async fn test_images_at_location_hides_undisplayed() {
        let image = |id, display| Image {
            id,
            name: format!("img{}", id),
            label: format!("Label {}", id),
            image_file: format!("img{}.nii.gz", id),
            display,
        };
        let store = MemoryStore::new()
            .with_images(vec![image(2, true), image(1, false)])
            .with_location_image(0, 0, 0, 2)
            .with_location_image(0, 0, 0, 1);

        let images = store.images_at_location(0, 0, 0).await.unwrap();
        assert_eq!(images.len(), 1);
        assert_eq!(images[0].id, 2);
        assert!(store.images_at_location(1, 0, 0).await.unwrap().is_empty());
    }
}
