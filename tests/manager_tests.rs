//! DatabaseManager 测试

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::json;
use tempfile::TempDir;
use tokio::sync::watch;
use tokio::time::timeout;
use travel_sample_db::*;

/// 收集上报错误
#[derive(Default)]
struct RecordingReporter {
    errors: Mutex<Vec<String>>,
}

impl ErrorReporter for RecordingReporter {
    fn report(&self, error: &Error) {
        self.errors.lock().push(error.to_string());
    }
}

fn db_config(tmp: &TempDir) -> DbConfig {
    DbConfig::local(tmp.path().join("travel-sample.db"))
}

/// 创建不带同步的管理器
fn setup_manager() -> (DatabaseManager, TempDir) {
    let tmp = TempDir::new().unwrap();
    let config = ManagerConfig::new(db_config(&tmp)).with_replication(false);
    let manager = DatabaseManager::open(config, &None::<SyncConfig>, Arc::new(LogErrorReporter)).unwrap();
    (manager, tmp)
}

fn names(list: &[Hotel]) -> Vec<String> {
    list.iter().map(|h| h.name.clone()).collect()
}

async fn wait_for_names(rx: &mut watch::Receiver<Vec<Hotel>>, expected: &[&str]) {
    let matched = timeout(Duration::from_secs(5), rx.wait_for(|list| names(list) == expected))
        .await
        .map(|r| r.is_ok())
        .unwrap_or(false);
    assert!(matched, "timed out waiting for {:?}, current {:?}", expected, names(&rx.borrow()));
}

fn count(manager: &DatabaseManager) -> i64 {
    manager.store().count(manager.collection()).unwrap()
}

// ==================== 初始化测试 ====================

mod setup_tests {
    use super::*;

    #[tokio::test]
    async fn test_setup_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let config = ManagerConfig::new(db_config(&tmp)).with_replication(false);

        let first = DatabaseManager::open(config.clone(), &None::<SyncConfig>, Arc::new(LogErrorReporter)).unwrap();
        first.add_new_element(&Hotel::new("Beachside Inn", "France")).unwrap();
        drop(first);

        let second = DatabaseManager::open(config, &None::<SyncConfig>, Arc::new(LogErrorReporter)).unwrap();
        let store = second.store();
        assert_eq!(store.collections().unwrap().len(), 1);
        assert_eq!(store.indexes(second.collection()).unwrap(), vec!["hotelNameIndex".to_string()]);
        assert_eq!(count(&second), 1);
    }

    #[tokio::test]
    async fn test_store_open_failure_is_fatal_and_reported() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("travel-sample.db");
        std::fs::create_dir_all(&path).unwrap();

        let reporter = Arc::new(RecordingReporter::default());
        let result = DatabaseManager::open(
            ManagerConfig::new(DbConfig::local(&path)),
            &None::<SyncConfig>,
            reporter.clone(),
        );

        match result {
            Err(e) => assert!(e.is_fatal()),
            Ok(_) => panic!("opening a directory as database should fail"),
        }
        assert_eq!(reporter.errors.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_missing_sync_config_is_recoverable() {
        let tmp = TempDir::new().unwrap();
        let reporter = Arc::new(RecordingReporter::default());

        let manager = DatabaseManager::open(
            ManagerConfig::new(db_config(&tmp)),
            &None::<SyncConfig>,
            reporter.clone(),
        )
        .unwrap();

        let errors = reporter.errors.lock().clone();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("配置错误"));
        assert!(manager.sync_status().is_none());

        // 存储照常可用
        manager.add_new_element(&Hotel::new("Mountain Lodge", "Switzerland")).unwrap();
        assert_eq!(count(&manager), 1);
    }

    #[test]
    fn test_open_requires_runtime() {
        let tmp = TempDir::new().unwrap();
        let result = DatabaseManager::open(
            ManagerConfig::new(db_config(&tmp)).with_replication(false),
            &None::<SyncConfig>,
            Arc::new(LogErrorReporter),
        );
        assert!(matches!(result, Err(Error::Runtime(_))));
    }
}

// ==================== 查询测试 ====================

mod query_tests {
    use super::*;

    #[tokio::test]
    async fn test_search_filter_and_sort() {
        let (manager, _tmp) = setup_manager();
        manager.add_new_element(&Hotel::new("Beachside Inn", "France")).unwrap();
        manager.add_new_element(&Hotel::new("Mountain Lodge", "Switzerland")).unwrap();

        let mut rx = manager.hotels();

        manager.query_elements(false, Some("Beach")).unwrap();
        wait_for_names(&mut rx, &["Beachside Inn"]).await;

        manager.query_elements(true, None).unwrap();
        wait_for_names(&mut rx, &["Mountain Lodge", "Beachside Inn"]).await;

        // 空搜索词等同于不搜索
        manager.query_elements(false, Some("  ")).unwrap();
        wait_for_names(&mut rx, &["Beachside Inn", "Mountain Lodge"]).await;
    }

    #[tokio::test]
    async fn test_other_record_kinds_are_excluded() {
        let (manager, _tmp) = setup_manager();
        manager.add_new_element(&Hotel::new("Beachside Inn", "France")).unwrap();

        let mut airline = Document::new(json!({"type": "airline", "id": "a1", "name": "Air Beach", "country": "US"}));
        manager.store().save(manager.collection(), &mut airline).unwrap();

        let mut rx = manager.hotels();
        manager.query_elements(false, None).unwrap();
        wait_for_names(&mut rx, &["Beachside Inn"]).await;
    }

    #[tokio::test]
    async fn test_decode_failures_are_skipped() {
        let (manager, _tmp) = setup_manager();
        manager.add_new_element(&Hotel::new("Alpine Rest", "Austria")).unwrap();
        // 缺少 country 和 id，无法解码
        let mut broken = Document::new(json!({"type": "hotel", "name": "Broken Hotel"}));
        manager.store().save(manager.collection(), &mut broken).unwrap();
        manager.add_new_element(&Hotel::new("Coral Bay", "Fiji")).unwrap();

        let mut rx = manager.hotels();
        manager.query_elements(false, None).unwrap();
        wait_for_names(&mut rx, &["Alpine Rest", "Coral Bay"]).await;
        assert_eq!(count(&manager), 3);
    }

    #[tokio::test]
    async fn test_explain_current_query() {
        let (manager, _tmp) = setup_manager();
        assert!(matches!(manager.explain_current_query(), Err(Error::Query(_))));

        manager.query_elements(false, Some("Beach")).unwrap();
        let plan = manager.explain_current_query().unwrap();
        assert!(plan.contains("fts_hotelNameIndex"));
    }
}

// ==================== 查询替换测试 ====================

mod replacement_tests {
    use super::*;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_superseded_query_never_publishes() {
        let (manager, _tmp) = setup_manager();
        manager.add_new_element(&Hotel::new("Beachside Inn", "France")).unwrap();
        manager.add_new_element(&Hotel::new("Mountain Lodge", "Switzerland")).unwrap();
        let mut rx = manager.hotels();

        // 反复切换，最后注册的是 "Mountain"
        for i in 0..20 {
            let text = if i % 2 == 0 { "Beach" } else { "Mountain" };
            manager.query_elements(i % 3 == 0, Some(text)).unwrap();
        }
        wait_for_names(&mut rx, &["Mountain Lodge"]).await;

        // 会出现在旧查询里的新记录
        manager.add_new_element(&Hotel::new("Beach Club", "Spain")).unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert_eq!(names(&rx.borrow()), vec!["Mountain Lodge"]);
    }

    #[tokio::test]
    async fn test_generation_advances_per_registration() {
        let (manager, _tmp) = setup_manager();
        let store = manager.store().clone();
        let live: LiveResults<Hotel> = LiveResults::new(tokio::runtime::Handle::current());

        let query = Query::select_all(manager.collection());
        assert_eq!(live.replace(&store, query.clone(), Parameters::new()).unwrap(), 1);
        assert_eq!(live.replace(&store, query, Parameters::new()).unwrap(), 2);
        assert_eq!(live.generation(), Some(2));

        live.release();
        live.release();
        assert_eq!(live.generation(), None);
    }

    #[tokio::test]
    async fn test_failed_registration_leaves_nothing_active() {
        let (manager, _tmp) = setup_manager();
        let store = manager.store().clone();
        let live: LiveResults<Hotel> = LiveResults::new(tokio::runtime::Handle::current());

        let ok = Query::select_all(manager.collection());
        live.replace(&store, ok, Parameters::new()).unwrap();

        // 未绑定参数，编译失败
        let bad = Query::select_all(manager.collection()).filter(Expr::equal("type", param("type")));
        assert!(live.replace(&store, bad, Parameters::new()).is_err());
        assert_eq!(live.generation(), None);
    }
}

// ==================== CRUD 测试 ====================

mod crud_tests {
    use super::*;

    #[tokio::test]
    async fn test_add_triggers_refresh() {
        let (manager, _tmp) = setup_manager();
        let mut rx = manager.hotels();
        manager.query_elements(false, None).unwrap();
        wait_for_names(&mut rx, &[]).await;

        manager.add_new_element(&Hotel::new("Harbour View", "Norway")).unwrap();
        wait_for_names(&mut rx, &["Harbour View"]).await;
    }

    #[tokio::test]
    async fn test_update_existing_element() {
        let (manager, _tmp) = setup_manager();
        let hotel = Hotel::new("Old Name", "Italy").with_city("Rome");
        manager.add_new_element(&hotel).unwrap();

        let mut rx = manager.hotels();
        manager.query_elements(false, None).unwrap();
        wait_for_names(&mut rx, &["Old Name"]).await;

        let renamed = Hotel {
            name: "New Name".into(),
            ..hotel.clone()
        };
        assert_eq!(manager.update_existing_element(&renamed).unwrap(), 1);
        wait_for_names(&mut rx, &["New Name"]).await;
        assert_eq!(rx.borrow()[0].city.as_deref(), Some("Rome"));
        assert_eq!(count(&manager), 1);
    }

    #[tokio::test]
    async fn test_update_missing_id_is_noop() {
        let (manager, _tmp) = setup_manager();
        manager.add_new_element(&Hotel::new("Beachside Inn", "France")).unwrap();

        let ghost = Hotel::new("Ghost", "Nowhere");
        assert_eq!(manager.update_existing_element(&ghost).unwrap(), 0);
        assert_eq!(count(&manager), 1);
    }

    #[tokio::test]
    async fn test_update_fans_out_to_all_matches() {
        let (manager, _tmp) = setup_manager();
        let hotel = Hotel::new("Twin", "Peru").with_id("dup");
        manager.add_new_element(&hotel).unwrap();
        manager.add_new_element(&hotel).unwrap();

        let updated = hotel.clone().with_phone("+51 1 234");
        assert_eq!(manager.update_existing_element(&updated).unwrap(), 2);
    }

    #[tokio::test]
    async fn test_delete_element() {
        let (manager, _tmp) = setup_manager();
        let hotel = Hotel::new("Beachside Inn", "France");
        manager.add_new_element(&hotel).unwrap();
        manager.add_new_element(&Hotel::new("Mountain Lodge", "Switzerland")).unwrap();

        let mut rx = manager.hotels();
        manager.query_elements(false, None).unwrap();
        wait_for_names(&mut rx, &["Beachside Inn", "Mountain Lodge"]).await;

        assert_eq!(manager.delete_element(&hotel).unwrap(), 1);
        wait_for_names(&mut rx, &["Mountain Lodge"]).await;

        // 再删一次是 no-op
        assert_eq!(manager.delete_element(&hotel).unwrap(), 0);
    }

    #[tokio::test]
    async fn test_bulk_delete_by_name() {
        let (manager, _tmp) = setup_manager();
        manager.add_new_element(&Hotel::new("Twin Hotel", "Chile")).unwrap();
        manager.add_new_element(&Hotel::new("Twin Hotel", "Chile")).unwrap();
        manager.add_new_element(&Hotel::new("Solo Hotel", "Chile")).unwrap();
        assert_eq!(count(&manager), 3);

        assert_eq!(manager.delete_element_with_name("Twin Hotel").unwrap(), 2);
        assert_eq!(count(&manager), 1);
    }

    #[tokio::test]
    async fn test_not_found_policy_error() {
        let tmp = TempDir::new().unwrap();
        let config = ManagerConfig::new(db_config(&tmp))
            .with_replication(false)
            .with_missing_record_policy(MissingRecordPolicy::Error);
        let manager = DatabaseManager::open(config, &None::<SyncConfig>, Arc::new(LogErrorReporter)).unwrap();

        let ghost = Hotel::new("Ghost", "Nowhere");
        assert!(matches!(manager.update_existing_element(&ghost), Err(Error::NotFound { .. })));
        assert!(matches!(manager.delete_element(&ghost), Err(Error::NotFound { .. })));
        assert!(matches!(
            manager.delete_element_with_name("Ghost"),
            Err(Error::NotFound { .. })
        ));
    }
}

// ==================== 生命周期测试 ====================

mod lifecycle_tests {
    use super::*;

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let (manager, _tmp) = setup_manager();
        let mut rx = manager.hotels();
        manager.query_elements(false, None).unwrap();
        wait_for_names(&mut rx, &[]).await;

        manager.shutdown();
        manager.shutdown();
        assert!(manager.is_shutdown());
        assert!(manager.explain_current_query().is_err());
        assert!(matches!(manager.query_elements(false, None), Err(Error::Runtime(_))));

        // 关闭后写入不再发布
        manager.add_new_element(&Hotel::new("Late Arrival", "Chile")).unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(rx.borrow().is_empty());
    }
}
