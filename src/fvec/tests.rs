//! Columnar Storage Tests
//!
//! ## Test Scopes
//! - **Compression**: scheme choice, accessor round trips, missing values.
//! - **In-place writes**: accepted and rejected writes, rebuilding.
//! - **Vectors**: row/chunk translation, upload, lazy loading, removal.
//! - **Frames**: column lookup and all-or-nothing lock helpers.
//! - **Subsets**: reads through to master rows, bounds, removal.

#[cfg(test)]
mod tests {
    use crate::error::ClusterError;
    use crate::fvec::builder::ChunkBuilder;
    use crate::fvec::chunk::{Chunk, Scheme, WriteOutcome};
    use crate::fvec::frame::Frame;
    use crate::fvec::subset::Subset;
    use crate::fvec::vector::{
        load_chunk, load_meta, optimal_rows_per_chunk, read_row, remove_vector, upload_vector,
        TypeHint, VecMeta,
    };
    use crate::key::Key;
    use crate::membership::cloud::CloudHandle;
    use crate::membership::types::{Node, NodeId};
    use crate::rpc::client::RpcClient;
    use crate::rpc::transport::LocalTransport;
    use crate::storage::codec::{type_tags, Storable, TypeRegistry};
    use crate::storage::memory::{DistributedStore, StoreConfig};
    use crate::storage::persist::MemPersist;
    use std::sync::Arc;
    use std::time::Duration;

    fn single_node_store() -> Arc<DistributedStore> {
        let node = Node::local(
            NodeId("solo".to_string()),
            "127.0.0.1:5100".parse().unwrap(),
        );
        let cloud = CloudHandle::bootstrap(node);
        let rpc = Arc::new(RpcClient::new(
            cloud.local_id().clone(),
            LocalTransport::new(),
            3,
            Duration::from_millis(200),
        ));
        Arc::new(DistributedStore::new(
            cloud,
            rpc,
            Arc::new(MemPersist::new()),
            Arc::new(TypeRegistry::new()),
            StoreConfig::default(),
        ))
    }

    fn build(values: &[f64]) -> Chunk {
        values.iter().copied().collect::<ChunkBuilder>().build()
    }

    fn assert_round_trip(values: &[f64], chunk: &Chunk) {
        assert_eq!(chunk.len(), values.len());
        for (row, v) in values.iter().enumerate() {
            if v.is_nan() {
                assert!(chunk.is_na(row), "row {} should be missing", row);
                assert!(chunk.at_f64(row).is_nan());
                assert_eq!(chunk.at_i64(row), None);
            } else {
                assert!(!chunk.is_na(row));
                assert_eq!(chunk.at_f64(row).to_bits(), v.to_bits(), "row {}", row);
            }
        }
        let decoded = Chunk::decode(&chunk.encode()).unwrap();
        assert_eq!(decoded.scheme(), chunk.scheme());
        for row in 0..values.len() {
            assert_eq!(decoded.is_na(row), chunk.is_na(row));
            if !chunk.is_na(row) {
                assert_eq!(decoded.at_f64(row).to_bits(), chunk.at_f64(row).to_bits());
            }
        }
    }

    // ============================================================
    // COMPRESSION TESTS
    // ============================================================

    #[test]
    fn test_constant_chunk() {
        let values = vec![7.5; 1000];
        let chunk = build(&values);

        assert_eq!(chunk.scheme(), Scheme::Constant);
        assert_eq!(chunk.byte_size(), 13);
        assert_round_trip(&values, &chunk);
    }

    #[test]
    fn test_small_integers_use_one_byte() {
        let values: Vec<f64> = (0..500).map(|i| (1000 + i % 200) as f64).collect();
        let chunk = build(&values);

        assert_eq!(chunk.scheme(), Scheme::Integer);
        assert_eq!(chunk.byte_size(), 5 + 9 + 500);
        assert_eq!(chunk.at_i64(3), Some(1003));
        assert_round_trip(&values, &chunk);
    }

    #[test]
    fn test_integer_width_grows_with_range() {
        let values: Vec<f64> = (0..100).map(|i| (i * 1000) as f64 - 50_000.0).collect();
        let chunk = build(&values);

        assert_eq!(chunk.scheme(), Scheme::Integer);
        assert_eq!(chunk.byte_size(), 5 + 9 + 100 * 4);
        assert_round_trip(&values, &chunk);
    }

    #[test]
    fn test_integer_missing_values_use_sentinel() {
        let mut values: Vec<f64> = (0..300).map(|i| (i % 100) as f64).collect();
        values[10] = f64::NAN;
        values[299] = f64::NAN;
        let chunk = build(&values);

        assert_eq!(chunk.scheme(), Scheme::Integer);
        assert!(chunk.is_na(10));
        assert_eq!(chunk.at_i64(11), Some(11));
        assert_round_trip(&values, &chunk);
    }

    #[test]
    fn test_few_distinct_doubles_use_unique() {
        let palette = [0.25, -1.5, 3.125, 1e300];
        let values: Vec<f64> = (0..400).map(|i| palette[i % palette.len()]).collect();
        let chunk = build(&values);

        assert_eq!(chunk.scheme(), Scheme::Unique);
        assert_round_trip(&values, &chunk);
    }

    #[test]
    fn test_mostly_zero_uses_sparse() {
        let mut values = vec![0.0; 2000];
        values[17] = 2.5;
        values[1999] = -0.75;
        values[500] = f64::NAN;
        let chunk = build(&values);

        assert_eq!(chunk.scheme(), Scheme::Sparse);
        assert_eq!(chunk.byte_size(), 5 + 4 + 3 * 12);
        assert_round_trip(&values, &chunk);
    }

    #[test]
    fn test_arbitrary_doubles_fall_back_to_raw() {
        let values: Vec<f64> = (0..300).map(|i| (i as f64).sqrt() * 1.1).collect();
        let chunk = build(&values);

        assert_eq!(chunk.scheme(), Scheme::Double);
        assert_round_trip(&values, &chunk);
    }

    #[test]
    fn test_negative_zero_is_preserved() {
        let values: Vec<f64> = (0..300).map(|i| if i % 2 == 0 { -0.0 } else { i as f64 }).collect();
        let chunk = build(&values);

        assert_ne!(chunk.scheme(), Scheme::Integer);
        assert_round_trip(&values, &chunk);
    }

    #[test]
    fn test_all_missing_chunk() {
        let values = vec![f64::NAN; 64];
        let chunk = build(&values);

        assert_eq!(chunk.scheme(), Scheme::Constant);
        assert!((0..64).all(|row| chunk.is_na(row)));
    }

    #[test]
    fn test_decode_rejects_damaged_bytes() {
        let chunk = build(&[1.0, 2.0, 3.0]);
        let bytes = chunk.encode();

        assert!(matches!(
            Chunk::decode(&bytes[..bytes.len() - 1]),
            Err(ClusterError::Codec(_))
        ));
        let mut bad = bytes.to_vec();
        bad[0] = 99;
        assert!(matches!(Chunk::decode(&bad), Err(ClusterError::Codec(_))));
    }

    #[test]
    fn test_decode_rejects_overflowing_bias() {
        // [Integer][len 1][width 1][bias i64::MAX][stored 5]
        let mut bytes = vec![Scheme::Integer as u8];
        bytes.extend_from_slice(&1u32.to_le_bytes());
        bytes.push(1);
        bytes.extend_from_slice(&i64::MAX.to_le_bytes());
        bytes.push(5);
        assert!(matches!(Chunk::decode(&bytes), Err(ClusterError::Codec(_))));

        // The missing-value sentinel is never biased, so it decodes.
        let last = bytes.len() - 1;
        bytes[last] = i8::MIN as u8;
        let chunk = Chunk::decode(&bytes).unwrap();
        assert!(chunk.is_na(0));
    }

    #[test]
    fn test_chunk_is_storable() {
        let chunk = build(&[1.0, 2.0, 3.0]);
        let restored = Chunk::from_bytes(&chunk.to_bytes().unwrap()).unwrap();
        assert_eq!(restored, chunk);
        assert_eq!(<Chunk as Storable>::TYPE_NAME, "chunk");
    }

    // ============================================================
    // IN-PLACE WRITE TESTS
    // ============================================================

    #[test]
    fn test_integer_write_out_of_range_is_rejected() {
        let values: Vec<f64> = (0..100).map(|i| i as f64).collect();
        let mut chunk = build(&values);
        assert_eq!(chunk.scheme(), Scheme::Integer);

        assert_eq!(chunk.set(5, 42.0), WriteOutcome::Written);
        assert_eq!(chunk.at_f64(5), 42.0);
        assert_eq!(chunk.set_na(6), WriteOutcome::Written);
        assert!(chunk.is_na(6));

        assert_eq!(chunk.set(7, 0.5), WriteOutcome::Rejected);
        assert_eq!(chunk.set(7, 1e9), WriteOutcome::Rejected);
        assert_eq!(chunk.at_f64(7), 7.0);
    }

    #[test]
    fn test_rejected_write_rebuilds_with_wider_scheme() {
        let mut chunk = build(&vec![1.0; 50]);
        assert_eq!(chunk.set(3, 2.0), WriteOutcome::Rejected);

        let mut builder = ChunkBuilder::from_chunk(&chunk);
        builder.set(3, 2.0);
        chunk = builder.build();

        assert_eq!(chunk.at_f64(3), 2.0);
        assert_eq!(chunk.at_f64(4), 1.0);
        assert_eq!(chunk.set(3, 0.1), WriteOutcome::Rejected);
    }

    #[test]
    fn test_sparse_and_double_accept_any_value() {
        let mut sparse = build(&{
            let mut v = vec![0.0; 1000];
            v[1] = 9.5;
            v
        });
        assert_eq!(sparse.scheme(), Scheme::Sparse);
        assert_eq!(sparse.set(400, 0.125), WriteOutcome::Written);
        assert_eq!(sparse.set(1, 0.0), WriteOutcome::Written);
        assert_eq!(sparse.at_f64(400), 0.125);
        assert_eq!(sparse.at_f64(1), 0.0);

        let mut raw = build(&[0.1, 0.2, 0.3]);
        assert_eq!(raw.set(0, f64::MAX), WriteOutcome::Written);
        assert_eq!(raw.at_f64(0), f64::MAX);
    }

    // ============================================================
    // VECTOR TESTS
    // ============================================================

    fn meta(espc: Vec<u64>) -> VecMeta {
        VecMeta {
            key: Key::new_vector(),
            len: *espc.last().unwrap(),
            espc,
            hint: TypeHint::Real,
        }
    }

    #[test]
    fn test_row_chunk_translation_covers_every_row() {
        let meta = meta(vec![0, 4, 8, 10]);

        assert_eq!(meta.n_chunks(), 3);
        let total: usize = (0..meta.n_chunks()).map(|c| meta.chunk_len(c)).sum();
        assert_eq!(total as u64, meta.len);

        for row in 0..meta.len {
            let (cidx, local) = meta.row_to_chunk(row).unwrap();
            assert!(local < meta.chunk_len(cidx));
            assert_eq!(meta.chunk_to_row(cidx, local), row);
        }
        assert_eq!(meta.row_to_chunk(4), Some((1, 0)));
        assert_eq!(meta.row_to_chunk(10), None);
    }

    #[test]
    fn test_optimal_rows_per_chunk() {
        assert_eq!(optimal_rows_per_chunk(5000, 8, 3), 5000);
        assert_eq!(optimal_rows_per_chunk(1_000_000, 4, 2), 31_250);
        assert_eq!(optimal_rows_per_chunk(10_000, 1000, 10), 10);
        assert_eq!(optimal_rows_per_chunk(usize::MAX / 2, 1, 1), 1 << 19);
    }

    #[tokio::test]
    async fn test_upload_and_read_vector() {
        let store = single_node_store();
        let values: Vec<f64> = (0..1003).map(|i| i as f64).collect();

        let meta = upload_vector(&store, &values, 250).await.unwrap();

        assert_eq!(meta.n_chunks(), 5);
        assert_eq!(meta.chunk_len(4), 3);
        assert_eq!(meta.hint, TypeHint::Integer);
        assert_eq!(load_meta(&store, &meta.key).await.unwrap(), meta);

        let chunk = load_chunk(&store, &meta, 2).await.unwrap();
        assert_eq!(chunk.at_f64(0), 500.0);
        assert_eq!(read_row(&store, &meta, 1002).await.unwrap(), 1002.0);
    }

    #[tokio::test]
    async fn test_remove_vector_deletes_chunks() {
        let store = single_node_store();
        let meta = upload_vector(&store, &[1.5, 2.5, 3.5], 2).await.unwrap();

        remove_vector(&store, &meta.key).await.unwrap();

        assert!(matches!(
            load_meta(&store, &meta.key).await,
            Err(ClusterError::NotFound(_))
        ));
        assert!(store.get(&meta.chunk_key(0)).await.unwrap().is_none());
        assert!(store.get(&meta.chunk_key(1)).await.unwrap().is_none());
    }

    // ============================================================
    // FRAME TESTS
    // ============================================================

    #[tokio::test]
    async fn test_frame_columns_and_locks() {
        let store = single_node_store();
        let a = upload_vector(&store, &[1.0, 2.0], 10).await.unwrap();
        let b = upload_vector(&store, &[3.0, 4.0], 10).await.unwrap();

        let mut frame = Frame::new();
        assert!(frame.add("a", a.key.clone()).is_none());
        frame.add("b", b.key.clone());
        assert_eq!(frame.add("b", b.key.clone()), Some(b.key.clone()));
        assert_eq!(frame.names(), &["a".to_string(), "b".to_string()]);
        assert_eq!(frame.vector("b"), Some(&b.key));

        let frame_key = Key::named("frame/prices");
        frame.save(&store, &frame_key).await.unwrap();
        assert_eq!(Frame::load(&store, &frame_key).await.unwrap(), frame);

        frame.read_lock(&store, "model-1").await.unwrap();
        let err = Frame::remove(&store, &frame_key).await.unwrap_err();
        assert!(matches!(err, ClusterError::Locked { .. }));

        frame.unlock(&store, "model-1").await.unwrap();
        Frame::remove(&store, &frame_key).await.unwrap();
        assert!(store.get(&frame_key).await.unwrap().is_none());
        assert!(store.get(&a.key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_failed_frame_lock_takes_no_column() {
        let store = single_node_store();
        let a = upload_vector(&store, &[1.0, 2.0], 10).await.unwrap();
        let b = upload_vector(&store, &[3.0, 4.0], 10).await.unwrap();
        let mut frame = Frame::new();
        frame.add("a", a.key.clone());
        frame.add("b", b.key.clone());

        store.write_lock(&b.key, "other").await.unwrap();

        let err = frame.write_lock(&store, "job").await.unwrap_err();
        assert!(matches!(err, ClusterError::Locked { ref holder, .. } if holder == "other"));
        let err = frame.read_lock(&store, "job").await.unwrap_err();
        assert!(matches!(err, ClusterError::Locked { ref holder, .. } if holder == "other"));

        // Column a was locked and released by both attempts.
        remove_vector(&store, &a.key).await.unwrap();

        store.unlock(&b.key, "other").await.unwrap();
        remove_vector(&store, &b.key).await.unwrap();
    }

    // ============================================================
    // SUBSET TESTS
    // ============================================================

    #[tokio::test]
    async fn test_subset_reads_selected_master_rows() {
        let store = single_node_store();
        let values: Vec<f64> = (0..50)
            .map(|i| if i == 7 { f64::NAN } else { i as f64 * 10.0 })
            .collect();
        let master = upload_vector(&store, &values, 10).await.unwrap();

        let subset = Subset::create(&store, &master, &[42, 3, 7, 3, 19], 2)
            .await
            .unwrap();
        assert_eq!(subset.len(), 5);
        assert_eq!(subset.n_chunks(), 3);

        let first = subset.chunk(&store, 0).await.unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(first.at_f64(0), 420.0);
        assert_eq!(first.at_i64(1), Some(30));

        let second = subset.chunk(&store, 1).await.unwrap();
        assert!(second.is_na(0));
        assert_eq!(second.at_i64(0), None);
        assert_eq!(second.at_f64(1), 30.0);

        assert_eq!(subset.read_row(&store, 4).await.unwrap(), 190.0);

        let mut last = subset.chunk(&store, 2).await.unwrap();
        assert_eq!(last.set(0, 1.0), WriteOutcome::Rejected);
        assert_eq!(last.set_na(0), WriteOutcome::Rejected);
        assert_eq!(last.to_chunk().iter().collect::<Vec<_>>(), vec![190.0]);

        let loaded = Subset::load(&store, &subset.meta.key).await.unwrap();
        assert_eq!(loaded.meta, subset.meta);
        assert_eq!(store.types().name_of(type_tags::SUBSET_META), Some("subset-meta"));
    }

    #[tokio::test]
    async fn test_subset_bounds_and_removal() {
        let store = single_node_store();
        let master = upload_vector(&store, &[1.0, 2.0, 3.0, 4.0, 5.0], 10).await.unwrap();

        let err = Subset::create(&store, &master, &[1, 5], 10).await.unwrap_err();
        assert_eq!(err, ClusterError::NotFound(master.key.clone()));

        let subset = Subset::create(&store, &master, &[4, 0], 10).await.unwrap();
        let rows = subset.meta.rows.clone();
        Subset::remove(&store, &subset.meta.key).await.unwrap();

        assert!(store.get(&subset.meta.key).await.unwrap().is_none());
        assert!(matches!(load_meta(&store, &rows).await, Err(ClusterError::NotFound(_))));
        assert_eq!(read_row(&store, &master, 4).await.unwrap(), 5.0);
    }
}
