//! In-memory object store standing in for the surrounding control plane.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::api::{
    Object, OwnerMachine, ScalewayCluster, ScalewayMachine, ScalewayManagedCluster,
    ScalewayManagedControlPlane, ScalewayManagedMachinePool,
};
use crate::controller::{KubeconfigSink, ReadinessSource, StatusSink, cluster_name_of};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Sink that keeps every persisted version of an object.
pub struct RecordingSink<T> {
    persisted: Mutex<Vec<T>>,
}

impl<T: Clone> RecordingSink<T> {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            persisted: Mutex::new(Vec::new()),
        })
    }

    pub fn last(&self) -> Option<T> {
        lock(&self.persisted).last().cloned()
    }

    pub fn count(&self) -> usize {
        lock(&self.persisted).len()
    }
}

#[async_trait]
impl<T: Object> StatusSink<T> for RecordingSink<T> {
    async fn persist(&self, object: &T) -> Result<()> {
        lock(&self.persisted).push(object.clone());
        Ok(())
    }
}

type Key = (&'static str, String, String);

/// Objects of every kind, stored serialized like the real control plane
/// stores them. An object that is deleting and has no finalizers left is
/// removed when persisted.
#[derive(Default)]
pub struct MemoryStore {
    objects: Mutex<BTreeMap<Key, serde_json::Value>>,
    owner_machines: Mutex<HashMap<(String, String), OwnerMachine>>,
    bootstrap_data: Mutex<HashMap<(String, String), Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn insert<T: Object + Serialize>(&self, object: &T) {
        let meta = object.meta();
        let value = serde_json::to_value(object).expect("object serializes");
        lock(&self.objects).insert((T::KIND, meta.namespace.clone(), meta.name.clone()), value);
    }

    pub fn get<T: Object + DeserializeOwned>(&self, namespace: &str, name: &str) -> Option<T> {
        let objects = lock(&self.objects);
        let value = objects.get(&(T::KIND, namespace.to_string(), name.to_string()))?;
        Some(serde_json::from_value(value.clone()).expect("object deserializes"))
    }

    /// Mark an object as deleted, the way an API server does when
    /// finalizers are pending.
    pub fn mark_deleted<T: Object + Serialize + DeserializeOwned>(
        &self,
        namespace: &str,
        name: &str,
    ) {
        if let Some(mut object) = self.get::<T>(namespace, name) {
            object.meta_mut().deletion_timestamp = Some(chrono::Utc::now());
            self.insert(&object);
        }
    }

    pub fn set_owner_machine(&self, namespace: &str, owner: OwnerMachine) {
        lock(&self.owner_machines).insert((namespace.to_string(), owner.name.clone()), owner);
    }

    pub fn set_bootstrap_data(&self, namespace: &str, secret_name: &str, data: &[u8]) {
        lock(&self.bootstrap_data).insert(
            (namespace.to_string(), secret_name.to_string()),
            data.to_vec(),
        );
    }

    fn all<T: Object + DeserializeOwned>(&self, namespace: &str) -> Vec<T> {
        lock(&self.objects)
            .iter()
            .filter(|((kind, ns, _), _)| *kind == T::KIND && ns == namespace)
            .map(|(_, value)| serde_json::from_value(value.clone()).expect("object deserializes"))
            .collect()
    }

    fn belonging<T: Object + DeserializeOwned>(
        &self,
        namespace: &str,
        cluster_name: &str,
    ) -> Vec<T> {
        self.all::<T>(namespace)
            .into_iter()
            .filter(|o| cluster_name_of(o) == cluster_name)
            .collect()
    }
}

#[async_trait]
impl<T: Object + Serialize + DeserializeOwned> StatusSink<T> for MemoryStore {
    async fn persist(&self, object: &T) -> Result<()> {
        let meta = object.meta();
        let key = (T::KIND, meta.namespace.clone(), meta.name.clone());
        if meta.is_deleting() && meta.finalizers.is_empty() {
            lock(&self.objects).remove(&key);
            return Ok(());
        }
        let value = serde_json::to_value(object).context("failed to serialize object")?;
        lock(&self.objects).insert(key, value);
        Ok(())
    }
}

#[async_trait]
impl ReadinessSource for MemoryStore {
    async fn owner_machine(&self, namespace: &str, name: &str) -> Result<Option<OwnerMachine>> {
        Ok(lock(&self.owner_machines)
            .get(&(namespace.to_string(), name.to_string()))
            .cloned())
    }

    async fn cluster(
        &self,
        namespace: &str,
        cluster_name: &str,
    ) -> Result<Option<ScalewayCluster>> {
        Ok(self.belonging(namespace, cluster_name).into_iter().next())
    }

    async fn machine_count(&self, namespace: &str, cluster_name: &str) -> Result<usize> {
        let machines: Vec<ScalewayMachine> = self.all(namespace);
        let owners = lock(&self.owner_machines);
        Ok(machines
            .iter()
            .filter(|m| {
                owners
                    .get(&(namespace.to_string(), m.meta.name.clone()))
                    .map_or_else(|| cluster_name_of(*m), |o| o.cluster_name.clone())
                    == cluster_name
            })
            .count())
    }

    async fn bootstrap_data(&self, namespace: &str, secret_name: &str) -> Result<Option<Vec<u8>>> {
        Ok(lock(&self.bootstrap_data)
            .get(&(namespace.to_string(), secret_name.to_string()))
            .cloned())
    }

    async fn managed_cluster(
        &self,
        namespace: &str,
        cluster_name: &str,
    ) -> Result<Option<ScalewayManagedCluster>> {
        Ok(self.belonging(namespace, cluster_name).into_iter().next())
    }

    async fn managed_control_plane(
        &self,
        namespace: &str,
        cluster_name: &str,
    ) -> Result<Option<ScalewayManagedControlPlane>> {
        Ok(self.belonging(namespace, cluster_name).into_iter().next())
    }

    async fn machine_pool_count(&self, namespace: &str, cluster_name: &str) -> Result<usize> {
        Ok(self
            .belonging::<ScalewayManagedMachinePool>(namespace, cluster_name)
            .len())
    }
}

/// Kubeconfigs keyed by namespace and cluster name.
#[derive(Default)]
pub struct MemoryKubeconfigs {
    kubeconfigs: Mutex<HashMap<(String, String), Vec<u8>>>,
}

impl MemoryKubeconfigs {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn get(&self, namespace: &str, cluster_name: &str) -> Option<Vec<u8>> {
        lock(&self.kubeconfigs)
            .get(&(namespace.to_string(), cluster_name.to_string()))
            .cloned()
    }
}

#[async_trait]
impl KubeconfigSink for MemoryKubeconfigs {
    async fn store(&self, namespace: &str, cluster_name: &str, kubeconfig: &[u8]) -> Result<()> {
        lock(&self.kubeconfigs).insert(
            (namespace.to_string(), cluster_name.to_string()),
            kubeconfig.to_vec(),
        );
        Ok(())
    }

    async fn delete(&self, namespace: &str, cluster_name: &str) -> Result<()> {
        lock(&self.kubeconfigs).remove(&(namespace.to_string(), cluster_name.to_string()));
        Ok(())
    }
}
