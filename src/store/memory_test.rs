//! Tests for the in-memory model store.

#[cfg(test)]
mod tests {
    use crate::store::memory::MemoryTable;
    use crate::store::model::{ExecutorModel, InstanceModel, ServiceModel};
    use crate::store::{Repositories, Repository, StoreError};

    #[tokio::test]
    async fn test_create_assigns_sequential_ids() {
        let table = MemoryTable::<ServiceModel>::new();
        let a = table.create(ServiceModel::new("a")).await.unwrap();
        let b = table.create(ServiceModel::new("b")).await.unwrap();
        assert_eq!(a.id, "1");
        assert_eq!(b.id, "2");

        let all = table.find_all().await.unwrap();
        assert_eq!(all.iter().map(|s| s.name.as_str()).collect::<Vec<_>>(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_save_requires_existing_row() {
        let table = MemoryTable::<ServiceModel>::new();
        let mut missing = ServiceModel::new("ghost");
        missing.id = "42".into();
        let err = table.save(&missing).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound { model: "service", .. }));

        let mut svc = table.create(ServiceModel::new("svc")).await.unwrap();
        svc.name = "renamed".into();
        table.save(&svc).await.unwrap();
        assert_eq!(table.get(&svc.id).await.unwrap().name, "renamed");
    }

    #[tokio::test]
    async fn test_destroy_reports_existence() {
        let table = MemoryTable::<ExecutorModel>::new();
        let exec = table.create(ExecutorModel::new("executor")).await.unwrap();
        assert!(table.destroy(&exec.id).await.unwrap());
        assert!(!table.destroy(&exec.id).await.unwrap());
        assert!(table.find_by_id(&exec.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_snapshot_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let repos = Repositories::open(dir.path()).unwrap();
            let exec = repos.executors.create(ExecutorModel::new("executor")).await.unwrap();
            let mut inst = InstanceModel::new(&exec.id, "1");
            inst.token = Some("tok".into());
            repos.instances.create(inst).await.unwrap();
        }

        let repos = Repositories::open(dir.path()).unwrap();
        let instances = repos.instances_of_executor("1").await.unwrap();
        assert_eq!(instances.len(), 1);
        assert_eq!(instances[0].token.as_deref(), Some("tok"));

        // Ids keep increasing after a reload.
        let next = repos.executors.create(ExecutorModel::new("executor")).await.unwrap();
        assert_eq!(next.id, "2");
    }

    #[tokio::test]
    async fn test_instance_queries() {
        let repos = Repositories::memory();
        repos.instances.create(InstanceModel::new("1", "10")).await.unwrap();
        repos.instances.create(InstanceModel::new("2", "10")).await.unwrap();
        repos.instances.create(InstanceModel::new("2", "11")).await.unwrap();

        assert_eq!(repos.instances_of_service("10").await.unwrap().len(), 2);
        assert_eq!(repos.instances_of_executor("2").await.unwrap().len(), 2);
        let found = repos.instance_for("2", "11").await.unwrap().unwrap();
        assert_eq!(found.id, "3");
        assert!(repos.instance_for("1", "11").await.unwrap().is_none());
    }
}
