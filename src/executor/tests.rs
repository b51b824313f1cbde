//! Executor Module Tests
//!
//! ## Test Scopes
//! - **Fork tree**: splitting, home-homogeneous cover, reassembly order.
//! - **Registry**: remote runners looked up by name.
//! - **Engine**: single-node runs, determinism, setup, failures, cancellation,
//!   retention of finished task states.
//!
//! *Note: remote dispatch across several nodes is covered in `tests/`.*

#[cfg(test)]
mod tests {
    use crate::config::NodeConfig;
    use crate::error::ClusterError;
    use crate::executor::executor::FINISHED_TASKS_RETAINED;
    use crate::executor::fork::{assemble, combine, gather, homogeneous_cover, split};
    use crate::executor::types::{
        Completion, LocalContext, MapReduce, TaskId, TaskRequest, TaskState,
    };
    use crate::fvec::chunk::Chunk;
    use crate::fvec::vector::upload_vector;
    use crate::membership::types::NodeId;
    use crate::node::LocalCluster;
    use serde::{Deserialize, Serialize};
    use std::collections::HashMap;
    use std::time::Duration;

    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    struct Sum {
        total: f64,
        rows: u64,
    }

    impl MapReduce for Sum {
        const NAME: &'static str = "test-sum";

        fn map(&mut self, chunks: &[Chunk]) -> anyhow::Result<()> {
            for v in chunks[0].iter().filter(|v| !v.is_nan()) {
                self.total += v;
                self.rows += 1;
            }
            Ok(())
        }

        fn reduce(&mut self, other: Self) -> anyhow::Result<()> {
            self.total += other.total;
            self.rows += other.rows;
            Ok(())
        }
    }

    /// First value of every partition, in reduction order.
    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    struct Firsts {
        seen: Vec<f64>,
    }

    impl MapReduce for Firsts {
        const NAME: &'static str = "test-firsts";

        fn map(&mut self, chunks: &[Chunk]) -> anyhow::Result<()> {
            self.seen.push(chunks[0].at_f64(0));
            Ok(())
        }

        fn reduce(&mut self, other: Self) -> anyhow::Result<()> {
            self.seen.extend(other.seen);
            Ok(())
        }
    }

    #[derive(Debug, Clone, Default, Serialize, Deserialize)]
    struct FailOn {
        poison: f64,
    }

    impl MapReduce for FailOn {
        const NAME: &'static str = "test-fail-on";

        fn map(&mut self, chunks: &[Chunk]) -> anyhow::Result<()> {
            if chunks[0].iter().any(|v| v == self.poison) {
                anyhow::bail!("found poison value {}", self.poison);
            }
            Ok(())
        }

        fn reduce(&mut self, _other: Self) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[derive(Debug, Clone, Default, Serialize, Deserialize)]
    struct Slow {
        delay_ms: u64,
        leaves: u64,
    }

    impl MapReduce for Slow {
        const NAME: &'static str = "test-slow";

        fn map(&mut self, _chunks: &[Chunk]) -> anyhow::Result<()> {
            std::thread::sleep(Duration::from_millis(self.delay_ms));
            self.leaves += 1;
            Ok(())
        }

        fn reduce(&mut self, other: Self) -> anyhow::Result<()> {
            self.leaves += other.leaves;
            Ok(())
        }
    }

    /// Pairs two vectors row by row.
    #[derive(Debug, Clone, Default, Serialize, Deserialize)]
    struct DotProduct {
        setup_on: Option<String>,
        dot: f64,
    }

    impl MapReduce for DotProduct {
        const NAME: &'static str = "test-dot";

        fn setup_local(&mut self, ctx: &LocalContext) -> anyhow::Result<()> {
            self.setup_on = Some(ctx.node.0.clone());
            Ok(())
        }

        fn map(&mut self, chunks: &[Chunk]) -> anyhow::Result<()> {
            anyhow::ensure!(self.setup_on.is_some(), "map ran before setup");
            self.dot += chunks[0].iter().zip(chunks[1].iter()).map(|(a, b)| a * b).sum::<f64>();
            Ok(())
        }

        fn reduce(&mut self, other: Self) -> anyhow::Result<()> {
            self.dot += other.dot;
            Ok(())
        }
    }

    fn single_node(workers: usize) -> LocalCluster {
        let config = NodeConfig {
            workers,
            ..NodeConfig::default()
        };
        LocalCluster::new(1, &config)
    }

    fn ids(names: &[&str]) -> Vec<NodeId> {
        names.iter().map(|n| NodeId(n.to_string())).collect()
    }

    // ============================================================
    // FORK TREE TESTS
    // ============================================================

    #[test]
    fn test_split_is_balanced() {
        assert_eq!(split(0, 2), 1);
        assert_eq!(split(0, 7), 3);
        assert_eq!(split(4, 7), 5);
    }

    #[test]
    fn test_cover_groups_subtrees_by_home() {
        let cover = homogeneous_cover(&ids(&["a", "a", "b", "b"]));
        assert_eq!(
            cover,
            vec![(0, 2, NodeId("a".into())), (2, 4, NodeId("b".into()))]
        );

        let cover = homogeneous_cover(&ids(&["a", "b", "a"]));
        assert_eq!(
            cover,
            vec![
                (0, 1, NodeId("a".into())),
                (1, 2, NodeId("b".into())),
                (2, 3, NodeId("a".into())),
            ]
        );

        let cover = homogeneous_cover(&ids(&["x"; 5]));
        assert_eq!(cover, vec![(0, 5, NodeId("x".into()))]);
        assert!(homogeneous_cover(&[]).is_empty());
    }

    #[test]
    fn test_assemble_folds_in_tree_order() {
        let mut parts: HashMap<(u32, u32), String> = HashMap::new();
        parts.insert((2, 3), "c".into());
        parts.insert((0, 1), "a".into());
        parts.insert((1, 2), "b".into());

        let mut pairs = Vec::new();
        let out = assemble(0, 3, &mut parts, &mut |l: String, r: String| {
            pairs.push(format!("{}+{}", l, r));
            Ok(l + &r)
        })
        .unwrap();

        assert_eq!(out, "abc");
        assert_eq!(pairs, vec!["b+c".to_string(), "a+bc".to_string()]);
    }

    #[test]
    fn test_assemble_reports_missing_partition() {
        let mut parts: HashMap<(u32, u32), u32> = HashMap::new();
        parts.insert((0, 1), 1);

        let err = assemble(0, 2, &mut parts, &mut |l: u32, r: u32| Ok(l + r)).unwrap_err();
        assert!(matches!(err, ClusterError::TaskFailed(_)));
    }

    #[test]
    fn test_combine_prefers_real_failures() {
        let failed = || ClusterError::TaskFailed("boom".into());

        let left: Result<(), _> = Err(ClusterError::Cancelled);
        assert_eq!(combine::<(), ()>(left, Err(failed())).unwrap_err(), failed());
        assert_eq!(
            combine::<(), ()>(Err(failed()), Err(ClusterError::Cancelled)).unwrap_err(),
            failed()
        );
        assert_eq!(combine::<u8, u8>(Ok(1), Ok(2)).unwrap(), (1, 2));
    }

    #[test]
    fn test_gather_keeps_order_and_prefers_real_failures() {
        let failed = || ClusterError::NodeLost(NodeId("b".into()));

        assert_eq!(gather::<u8>(vec![Ok(1), Ok(2), Ok(3)]).unwrap(), vec![1, 2, 3]);
        assert_eq!(
            gather::<u8>(vec![Err(ClusterError::Cancelled), Ok(2), Err(failed())]).unwrap_err(),
            failed()
        );
        assert_eq!(
            gather::<u8>(vec![Err(failed()), Err(ClusterError::Cancelled)]).unwrap_err(),
            failed()
        );
        assert_eq!(
            gather::<u8>(vec![Ok(1), Err(ClusterError::Cancelled)]).unwrap_err(),
            ClusterError::Cancelled
        );
    }

    // ============================================================
    // REGISTRY TESTS
    // ============================================================

    #[tokio::test]
    async fn test_registry_unknown_task_fails() {
        let cluster = single_node(2);
        let engine = cluster.node(0).engine();
        engine.register::<Sum>();

        assert!(engine.registry().has_task("test-sum"));
        assert_eq!(engine.registry().list_tasks(), vec!["test-sum".to_string()]);

        let request = TaskRequest {
            task_id: TaskId::new(),
            name: "no-such-task".into(),
            state: Vec::new(),
            vectors: Vec::new(),
            ranges: vec![(0, 1)],
        };
        let err = engine.serve_remote(request).await.unwrap_err();
        assert!(matches!(err, ClusterError::TaskFailed(_)));
    }

    #[tokio::test]
    async fn test_registry_runs_remote_subtrees() {
        let cluster = single_node(2);
        let node = cluster.node(0);
        node.engine().register::<Sum>();
        let values: Vec<f64> = (0..40).map(|i| i as f64).collect();
        let meta = upload_vector(node.store(), &values, 10).await.unwrap();

        let request = TaskRequest {
            task_id: TaskId::new(),
            name: Sum::NAME.into(),
            state: bincode::serialize(&Sum::default()).unwrap(),
            vectors: vec![meta.key.clone()],
            ranges: vec![(0, 2), (3, 4)],
        };
        let partials = node.engine().serve_remote(request).await.unwrap();

        assert_eq!(partials.len(), 2);
        let first: Sum = bincode::deserialize(&partials[0].state).unwrap();
        let second: Sum = bincode::deserialize(&partials[1].state).unwrap();
        assert_eq!((partials[0].lo, partials[0].hi), (0, 2));
        assert_eq!(first.total, (0..20).sum::<i32>() as f64);
        assert_eq!(second.total, (30..40).sum::<i32>() as f64);
    }

    // ============================================================
    // ENGINE TESTS
    // ============================================================

    #[tokio::test]
    async fn test_sum_over_single_node() {
        let cluster = single_node(4);
        let node = cluster.node(0);
        let values: Vec<f64> = (0..1000).map(|i| i as f64).collect();
        let meta = upload_vector(node.store(), &values, 100).await.unwrap();

        let handle = node.engine().submit(Sum::default(), &[meta.key.clone()]);
        let task_id = handle.id().clone();
        let result = handle.join().await.unwrap().into_done().unwrap();

        assert_eq!(result.total, 499_500.0);
        assert_eq!(result.rows, 1000);
        assert_eq!(node.engine().status(&task_id), Some(TaskState::Done));
    }

    #[tokio::test]
    async fn test_non_commutative_reduce_is_deterministic() {
        let cluster = single_node(8);
        let node = cluster.node(0);
        let values: Vec<f64> = (0..70).map(|i| i as f64).collect();
        let meta = upload_vector(node.store(), &values, 10).await.unwrap();

        let first = node
            .engine()
            .run(Firsts::default(), &[meta.key.clone()])
            .await
            .unwrap();
        let second = node
            .engine()
            .run(Firsts::default(), &[meta.key.clone()])
            .await
            .unwrap();

        let expected: Vec<f64> = (0..7).map(|c| (c * 10) as f64).collect();
        assert_eq!(first, Completion::Done(Firsts { seen: expected }));
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_empty_vector_returns_prototype() {
        let cluster = single_node(2);
        let node = cluster.node(0);
        let meta = upload_vector(node.store(), &[], 10).await.unwrap();
        assert_eq!(meta.n_chunks(), 0);

        let prototype = Sum {
            total: 5.0,
            rows: 0,
        };
        let result = node
            .engine()
            .run(prototype.clone(), &[meta.key.clone()])
            .await
            .unwrap();

        assert_eq!(result, Completion::Done(prototype));
    }

    #[tokio::test]
    async fn test_setup_runs_before_map_over_two_vectors() {
        let cluster = single_node(2);
        let node = cluster.node(0);
        let xs: Vec<f64> = (0..30).map(|i| i as f64).collect();
        let ys = vec![2.0; 30];
        let x = upload_vector(node.store(), &xs, 10).await.unwrap();
        let y = upload_vector(node.store(), &ys, 10).await.unwrap();

        let result = node
            .engine()
            .run(DotProduct::default(), &[x.key.clone(), y.key.clone()])
            .await
            .unwrap()
            .into_done()
            .unwrap();

        assert_eq!(result.dot, 2.0 * (0..30).sum::<i32>() as f64);
        assert_eq!(result.setup_on.as_deref(), Some("node-00"));
    }

    #[tokio::test]
    async fn test_misaligned_vectors_are_rejected() {
        let cluster = single_node(2);
        let node = cluster.node(0);
        let values = vec![1.0; 30];
        let x = upload_vector(node.store(), &values, 10).await.unwrap();
        let y = upload_vector(node.store(), &values, 15).await.unwrap();

        let err = node
            .engine()
            .run(DotProduct::default(), &[x.key.clone(), y.key.clone()])
            .await
            .unwrap_err();
        assert!(matches!(err, ClusterError::TaskFailed(_)));
    }

    #[tokio::test]
    async fn test_missing_vector_fails_task() {
        let cluster = single_node(2);
        let node = cluster.node(0);

        let err = node
            .engine()
            .run(Sum::default(), &[crate::key::Key::new_vector()])
            .await
            .unwrap_err();
        assert!(matches!(err, ClusterError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_map_failure_fails_whole_task() {
        let cluster = single_node(4);
        let node = cluster.node(0);
        let values: Vec<f64> = (0..100).map(|i| i as f64).collect();
        let meta = upload_vector(node.store(), &values, 10).await.unwrap();

        let handle = node
            .engine()
            .submit(FailOn { poison: 42.0 }, &[meta.key.clone()]);
        let task_id = handle.id().clone();
        let err = handle.join().await.unwrap_err();

        assert!(matches!(err, ClusterError::TaskFailed(ref msg) if msg.contains("poison")));
        assert!(matches!(
            node.engine().status(&task_id),
            Some(TaskState::Failed { .. })
        ));
    }

    #[tokio::test]
    async fn test_cancel_midway_yields_cancelled() {
        let cluster = single_node(1);
        let node = cluster.node(0);
        let values = vec![1.0; 20];
        let meta = upload_vector(node.store(), &values, 1).await.unwrap();
        assert_eq!(meta.n_chunks(), 20);

        let handle = node.engine().submit(
            Slow {
                delay_ms: 40,
                leaves: 0,
            },
            &[meta.key.clone()],
        );

        tokio::time::timeout(Duration::from_secs(10), async {
            while handle.progress() < 10 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("half of the leaves should finish");

        assert!(node.engine().cancel(handle.id()));
        let task_id = handle.id().clone();
        let outcome = handle.join().await.unwrap();

        assert!(outcome.is_cancelled());
        assert_eq!(node.engine().status(&task_id), Some(TaskState::Cancelled));
    }

    #[tokio::test]
    async fn test_finished_task_states_are_bounded() {
        let cluster = single_node(1);
        let node = cluster.node(0);
        let meta = upload_vector(node.store(), &[], 10).await.unwrap();

        let mut ids = Vec::new();
        for _ in 0..FINISHED_TASKS_RETAINED + 4 {
            let handle = node.engine().submit(Sum::default(), &[meta.key.clone()]);
            ids.push(handle.id().clone());
            handle.join().await.unwrap();
        }

        assert_eq!(node.engine().status(&ids[0]), None);
        assert_eq!(node.engine().status(&ids[3]), None);
        assert_eq!(node.engine().status(&ids[4]), Some(TaskState::Done));
        assert_eq!(node.engine().status(ids.last().unwrap()), Some(TaskState::Done));
    }

    #[tokio::test]
    async fn test_cancel_unknown_task() {
        let cluster = single_node(1);
        assert!(!cluster.node(0).engine().cancel(&TaskId::new()));
    }
}
