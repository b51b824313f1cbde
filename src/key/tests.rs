#[cfg(test)]
mod tests {
    use crate::key::{home_of, is_home, Key, KeyKind};
    use crate::membership::cloud::Cloud;
    use crate::membership::types::{Node, NodeId};

    fn cloud_of(ids: &[&str]) -> Cloud {
        let members = ids
            .iter()
            .enumerate()
            .map(|(i, id)| {
                Node::local(
                    NodeId(id.to_string()),
                    format!("127.0.0.1:{}", 5000 + i).parse().unwrap(),
                )
            })
            .collect();
        Cloud::new(1, members)
    }

    // ============================================================
    // KEY LAYOUT TESTS
    // ============================================================

    #[test]
    fn test_plain_key_display() {
        let k = Key::named("book_100");

        assert_eq!(k.kind(), KeyKind::Plain);
        assert_eq!(k.to_string(), "book_100");
        assert!(k.chunk_index().is_none());
        assert!(k.vector_key().is_none());
    }

    #[test]
    fn test_chunk_key_embeds_index_and_vector() {
        let v = Key::new_vector();
        let c = Key::chunk(&v, 7);

        assert_eq!(c.kind(), KeyKind::Chunk);
        assert_eq!(c.chunk_index(), Some(7));
        assert_eq!(c.vector_key(), Some(v.clone()));
        assert_eq!(Key::chunk(&c, 3), Key::chunk(&v, 3));
        assert!(c.to_string().ends_with("#7"));
    }

    #[test]
    fn test_hex_round_trip_and_validation() {
        let c = Key::chunk(&Key::new_vector(), 42);

        assert_eq!(Key::from_hex(&c.to_hex()).unwrap(), c);
        assert!(Key::from_hex("09").is_err());
        assert!(Key::from_hex("01ff").is_err(), "vector keys are 17 bytes");
    }

    // ============================================================
    // HOME ASSIGNMENT TESTS
    // ============================================================

    #[test]
    fn test_home_is_stable_and_live() {
        let cloud = cloud_of(&["a", "b", "c"]);
        let local = NodeId("a".to_string());

        for i in 0..200 {
            let k = Key::named(&format!("key-{}", i));
            let h1 = home_of(&k, &cloud, &local);
            let h2 = home_of(&k, &cloud, &local);
            assert_eq!(h1, h2);
            assert!(cloud.contains(&h1));
        }
    }

    #[test]
    fn test_empty_cloud_resolves_to_self() {
        let local = NodeId("me".to_string());

        assert_eq!(home_of(&Key::named("x"), &Cloud::empty(), &local), local);
        assert!(is_home(&Key::named("x"), &Cloud::empty(), &local));
    }

    #[test]
    fn test_adding_a_node_moves_keys_only_to_it() {
        let before = cloud_of(&["a", "b", "c"]);
        let after = cloud_of(&["a", "b", "c", "d"]);
        let local = NodeId("a".to_string());
        let mut moved = 0;

        for i in 0..1000 {
            let k = Key::named(&format!("key-{}", i));
            let h1 = home_of(&k, &before, &local);
            let h2 = home_of(&k, &after, &local);
            if h1 != h2 {
                assert_eq!(h2.0, "d", "keys may only move to the new node");
                moved += 1;
            }
        }

        assert!(moved > 0 && moved < 500, "moved {} of 1000", moved);
    }

    #[test]
    fn test_chunks_are_homed_round_robin() {
        let cloud = cloud_of(&["a", "b", "c"]);
        let local = NodeId("a".to_string());
        let v = Key::new_vector();

        let anchor = home_of(&v, &cloud, &local);
        let start = cloud.index_of(&anchor).unwrap();

        for cidx in 0..6u32 {
            let home = home_of(&Key::chunk(&v, cidx), &cloud, &local);
            let expected = &cloud.members()[(start + cidx as usize) % 3].id;
            assert_eq!(&home, expected);
        }
    }
}
