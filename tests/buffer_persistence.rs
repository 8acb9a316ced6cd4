//! Durable buffer guarantees: crash-safe persistence, priority ordering,
//! retention, and space reclamation, exercised through reopen cycles.

use tempfile::TempDir;

use sidra_telemetry::config::BufferConfig;
use sidra_telemetry::local_buffer::{BufferStore, DurableBuffer};

fn buffer_config(dir: &TempDir) -> BufferConfig {
    BufferConfig {
        enabled: true,
        path: dir.path().join("buffer.dat").to_string_lossy().into_owned(),
        max_size_mb: 10,
        retention_hours: 24,
    }
}

#[tokio::test]
async fn unacknowledged_items_survive_a_restart() {
    let dir = TempDir::new().unwrap();
    let config = buffer_config(&dir);

    {
        let buffer = DurableBuffer::open(&config).await.unwrap();
        buffer.append("batch-a".to_string(), 2).await.unwrap();
        buffer.append("batch-b".to_string(), 0).await.unwrap();
        buffer.append("batch-c".to_string(), 2).await.unwrap();
        // "crash": the buffer handle is dropped without any delete
    }

    let buffer = DurableBuffer::open(&config).await.unwrap();
    assert_eq!(buffer.count().await.unwrap(), 3);

    let items = buffer.peek_batch(10).await.unwrap();
    let payloads: Vec<&str> = items.iter().map(|i| i.data.as_str()).collect();
    // critical first, then the two normals by age
    assert_eq!(payloads, vec!["batch-b", "batch-a", "batch-c"]);
}

#[tokio::test]
async fn acknowledged_items_stay_deleted_after_restart() {
    let dir = TempDir::new().unwrap();
    let config = buffer_config(&dir);

    let first_id;
    {
        let buffer = DurableBuffer::open(&config).await.unwrap();
        first_id = buffer.append("delivered".to_string(), 2).await.unwrap();
        buffer.append("pending".to_string(), 2).await.unwrap();
        buffer.delete(vec![first_id]).await.unwrap();
    }

    let buffer = DurableBuffer::open(&config).await.unwrap();
    assert_eq!(buffer.count().await.unwrap(), 1);
    let items = buffer.peek_batch(10).await.unwrap();
    assert_eq!(items[0].data, "pending");
    assert_ne!(items[0].id, first_id);
}

#[tokio::test]
async fn peek_order_is_priority_then_age_then_insertion_id() {
    let dir = TempDir::new().unwrap();
    let buffer = DurableBuffer::open(&buffer_config(&dir)).await.unwrap();

    // interleave priorities; created_at is monotone with insertion here,
    // so the id tie-break is what keeps equal-priority items stable
    let low = buffer.append("low".to_string(), 3).await.unwrap();
    let n1 = buffer.append("normal-1".to_string(), 2).await.unwrap();
    let crit = buffer.append("critical".to_string(), 0).await.unwrap();
    let n2 = buffer.append("normal-2".to_string(), 2).await.unwrap();
    let high = buffer.append("high".to_string(), 1).await.unwrap();

    let order: Vec<u64> = buffer
        .peek_batch(10)
        .await
        .unwrap()
        .iter()
        .map(|i| i.id)
        .collect();
    assert_eq!(order, vec![crit, high, n1, n2, low]);

    // limit applies after ordering
    let top2: Vec<u64> = buffer
        .peek_batch(2)
        .await
        .unwrap()
        .iter()
        .map(|i| i.id)
        .collect();
    assert_eq!(top2, vec![crit, high]);
}

#[tokio::test]
async fn retry_marks_accumulate_and_persist() {
    let dir = TempDir::new().unwrap();
    let config = buffer_config(&dir);

    {
        let buffer = DurableBuffer::open(&config).await.unwrap();
        let id = buffer.append("flaky".to_string(), 2).await.unwrap();
        buffer.mark_retry(id).await.unwrap();
        buffer.mark_retry(id).await.unwrap();
        buffer.mark_retry(id).await.unwrap();
    }

    let buffer = DurableBuffer::open(&config).await.unwrap();
    let items = buffer.peek_batch(1).await.unwrap();
    assert_eq!(items[0].retry_count, 3);
}

#[tokio::test]
async fn stats_reflect_priorities_and_occupancy() {
    let dir = TempDir::new().unwrap();
    let buffer = DurableBuffer::open(&buffer_config(&dir)).await.unwrap();

    buffer.append("a".to_string(), 0).await.unwrap();
    buffer.append("b".to_string(), 2).await.unwrap();
    buffer.append("c".to_string(), 2).await.unwrap();

    let stats = buffer.stats().await.unwrap();
    assert_eq!(stats.total_items, 3);
    assert_eq!(stats.by_priority.get(&0), Some(&1));
    assert_eq!(stats.by_priority.get(&2), Some(&2));
    assert!(stats.size_bytes > 0);
    assert!(!stats.is_full);
    assert!(stats.oldest_item_age >= 0.0);
}

#[tokio::test]
async fn vacuum_compacts_without_losing_live_items() {
    let dir = TempDir::new().unwrap();
    let buffer = DurableBuffer::open(&buffer_config(&dir)).await.unwrap();

    let mut ids = Vec::new();
    for i in 0..20 {
        ids.push(buffer.append(format!("payload-{i}"), 2).await.unwrap());
    }
    buffer.delete(ids[..15].to_vec()).await.unwrap();

    let before = buffer.size_bytes().await.unwrap();
    buffer.vacuum().await.unwrap();
    let after = buffer.size_bytes().await.unwrap();

    assert!(after < before);
    assert_eq!(buffer.count().await.unwrap(), 5);
    let survivors: Vec<String> = buffer
        .peek_batch(10)
        .await
        .unwrap()
        .into_iter()
        .map(|i| i.data)
        .collect();
    assert_eq!(
        survivors,
        (15..20).map(|i| format!("payload-{i}")).collect::<Vec<_>>()
    );
}

#[test]
fn zero_budget_store_keeps_only_critical_items() {
    let dir = TempDir::new().unwrap();
    let mut store = BufferStore::open(&dir.path().join("buffer.dat"), 0, 24).unwrap();

    store.append(b"critical-1", 0).unwrap();
    store.append(b"normal-1", 2).unwrap();
    store.append(b"critical-2", 0).unwrap();
    store.append(b"low-1", 3).unwrap();

    let items = store.peek_batch(10).unwrap();
    assert_eq!(items.len(), 2);
    assert!(items.iter().all(|i| i.priority == 0));
}
