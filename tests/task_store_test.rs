//! Store behavior for the in-memory task store.

mod common;

use waypoint::InMemoryTaskStore;

#[tokio::test]
async fn test_in_memory_store_contract() {
    common::store_contract(InMemoryTaskStore::new()).await;
}
