mod common;

use common::player_index;
use common::run_in_task;
use common::test_env;
use common::PlayerRecord;
use common::TestEnv;
use common::PLAYER_TABLE;
use gamesvr_core::hash_table_load;
use gamesvr_core::hash_table_update_cas;
use gamesvr_core::proto::error::ErrorCode;
use gamesvr_core::RpcResult;
use gamesvr_core::Settings;

async fn read_player(
    env: &TestEnv,
    index: &str,
) -> RpcResult<(PlayerRecord, u64)> {
    let dispatcher = env.dispatcher.clone();
    let index = index.to_string();
    run_in_task(&env.app, move |ctx| async move {
        hash_table_load::<PlayerRecord>(&ctx, &dispatcher, PLAYER_TABLE, &index).await
    })
    .await
}

#[tokio::test]
async fn test_load_after_forced_write() {
    let env = test_env(Settings::default()).await;
    let dispatcher = env.dispatcher.clone();

    let (loaded, cas_version) = run_in_task(&env.app, move |ctx| async move {
        let index = player_index(42);
        let err = hash_table_load::<PlayerRecord>(&ctx, &dispatcher, PLAYER_TABLE, &index)
            .await
            .unwrap_err();
        assert!(err.is(ErrorCode::DbRecordNotFound));

        let record = PlayerRecord {
            uid: 42,
            lv: 1,
            nickname: String::new(),
        };
        let mut cas_version = 0;
        hash_table_update_cas(&ctx, &dispatcher, PLAYER_TABLE, &index, &record, &mut cas_version, true).await?;
        assert_eq!(cas_version, 1);

        hash_table_load::<PlayerRecord>(&ctx, &dispatcher, PLAYER_TABLE, &index).await
    })
    .await
    .unwrap();

    assert_eq!(cas_version, 1);
    assert_eq!(loaded.uid, 42);
    assert_eq!(loaded.lv, 1);
}

#[tokio::test]
async fn test_cas_conflict_then_retry() {
    let env = test_env(Settings::default()).await;
    let index = player_index(42);

    let seed = env.dispatcher.clone();
    let seed_index = index.clone();
    run_in_task(&env.app, move |ctx| async move {
        let record = PlayerRecord {
            uid: 42,
            lv: 1,
            nickname: "seed".to_string(),
        };
        let mut cas_version = 0;
        hash_table_update_cas(&ctx, &seed, PLAYER_TABLE, &seed_index, &record, &mut cas_version, true).await
    })
    .await
    .unwrap();

    // Both writers read version 1 before either writes
    let (mut record_a, version_a) = read_player(&env, &index).await.unwrap();
    let (mut record_b, version_b) = read_player(&env, &index).await.unwrap();
    assert_eq!((version_a, version_b), (1, 1));

    let dispatcher = env.dispatcher.clone();
    let task_index = index.clone();
    let stored = run_in_task(&env.app, move |ctx| async move {
        record_a.lv = 2;
        let mut expected_a = version_a;
        hash_table_update_cas(&ctx, &dispatcher, PLAYER_TABLE, &task_index, &record_a, &mut expected_a, false).await?;
        assert_eq!(expected_a, 2);

        record_b.nickname = "b".to_string();
        let mut expected_b = version_b;
        let err = hash_table_update_cas(&ctx, &dispatcher, PLAYER_TABLE, &task_index, &record_b, &mut expected_b, false)
            .await
            .unwrap_err();
        assert!(err.is(ErrorCode::DbCasCheckFailed));

        let (mut fresh, mut expected_b) =
            hash_table_load::<PlayerRecord>(&ctx, &dispatcher, PLAYER_TABLE, &task_index).await?;
        assert_eq!(expected_b, 2);
        fresh.nickname = "b".to_string();
        hash_table_update_cas(&ctx, &dispatcher, PLAYER_TABLE, &task_index, &fresh, &mut expected_b, false).await?;
        Ok(expected_b)
    })
    .await
    .unwrap();

    assert_eq!(stored, 3);
    assert_eq!(env.store.field(&index, "lv"), Some(b"&2".to_vec()));
    assert_eq!(env.store.field(&index, "nickname"), Some(b"&b".to_vec()));
}
