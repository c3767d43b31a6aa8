#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use crate::db::DbError;
    use crate::db::tests::helpers::{hnsw_config, indexed, open, synthetic_row, tag};
    use crate::distance::Metric;
    use crate::index::IndexType;
    use crate::metadata::{CmpOp, Filter, MetaValue};

    #[test]
    fn test_cosine_search_scenario() {
        // Four unit-ish rows; query (1,0,0,0): ordinal 0 at distance 0,
        // then the diagonal row at 1 − 0.5.
        let tmp = TempDir::new().unwrap();
        let db = open(tmp.path(), hnsw_config());
        db.add_vector(&[1.0, 0.0, 0.0, 0.0], &[]).unwrap();
        db.add_vector(&[0.0, 1.0, 0.0, 0.0], &[]).unwrap();
        db.add_vector(&[0.0, 0.0, 1.0, 0.0], &[]).unwrap();
        db.add_vector(&[0.5, 0.5, 0.5, 0.5], &[]).unwrap();

        let hits = db.search(&[1.0, 0.0, 0.0, 0.0], 2, Metric::Cosine).unwrap();
        assert_eq!(hits[0].ordinal, 0);
        assert!(hits[0].distance.abs() < 1e-6);
        assert_eq!(hits[1].ordinal, 3);
        assert!((hits[1].distance - 0.5).abs() < 1e-5);
    }

    #[test]
    fn test_results_carry_vector_and_metadata_payload() {
        let tmp = TempDir::new().unwrap();
        let db = open(tmp.path(), hnsw_config());
        db.add_vector(&[1.0, 2.0, 3.0, 4.0], &tag("category", "science"))
            .unwrap();

        let hits = db.search(&[1.0, 2.0, 3.0, 4.0], 1, Metric::L2).unwrap();
        assert_eq!(hits[0].vector, vec![1.0, 2.0, 3.0, 4.0]);
        assert_eq!(hits[0].metadata[0].0, "category");
    }

    #[test]
    fn test_boundary_cases() {
        let tmp = TempDir::new().unwrap();
        let db = open(tmp.path(), hnsw_config());

        // Empty database: zero results, not an error.
        assert!(db.search(&[0.0; 4], 3, Metric::L2).unwrap().is_empty());

        db.add_vector(&[1.0, 0.0, 0.0, 0.0], &[]).unwrap();
        db.add_vector(&[0.0, 1.0, 0.0, 0.0], &[]).unwrap();

        // k = 0 is an error.
        assert!(matches!(
            db.search(&[0.0; 4], 0, Metric::L2).unwrap_err(),
            DbError::InvalidArgument(_)
        ));

        // k > count clamps to count.
        assert_eq!(db.search(&[0.0; 4], 50, Metric::L2).unwrap().len(), 2);

        // Query dimension is checked.
        assert!(matches!(
            db.search(&[0.0; 3], 1, Metric::L2).unwrap_err(),
            DbError::DimensionMismatch { .. }
        ));
    }

    #[test]
    fn test_filtered_search_returns_only_matching_rows() {
        // Two rows, one tagged; the filter must return only it.
        let tmp = TempDir::new().unwrap();
        let db = open(tmp.path(), hnsw_config());
        let tagged = db
            .add_vector(&[1.0, 0.0, 0.0, 0.0], &tag("category", "science"))
            .unwrap();
        db.add_vector(&[0.9, 0.1, 0.0, 0.0], &[]).unwrap();

        let filter = Filter::eq("category", MetaValue::Str("science".into()));
        let hits = db
            .search_filtered(&[1.0, 0.0, 0.0, 0.0], 5, Metric::L2, &filter)
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].ordinal, tagged);
    }

    #[test]
    fn test_filtered_search_on_indexed_path_oversamples() {
        let mut config = indexed(hnsw_config());
        config.dimension = 8;
        let tmp = TempDir::new().unwrap();
        let db = open(tmp.path(), config);

        // 120 rows, every third tagged.
        for i in 0..120 {
            let meta = if i % 3 == 0 {
                tag("bucket", "keep")
            } else {
                tag("bucket", "drop")
            };
            db.add_vector(&synthetic_row(i, 8), &meta).unwrap();
        }

        let filter = Filter::eq("bucket", MetaValue::Str("keep".into()));
        let q = synthetic_row(33, 8); // 33 % 3 == 0, tagged "keep"
        let hits = db.search_filtered(&q, 5, Metric::L2, &filter).unwrap();

        assert!(!hits.is_empty());
        assert!(hits.len() <= 5);
        assert_eq!(hits[0].ordinal, 33);
        for hit in &hits {
            assert_eq!(hit.metadata[0].1, MetaValue::Str("keep".into()));
        }
    }

    #[test]
    fn test_filtered_search_on_diskann_with_scan_only_filter() {
        // A filter no posting list can serve (Contains) on a DiskAnn
        // database: the oversample pool falls back to the DiskANN beam
        // width, not an HNSW knob.
        let mut config = indexed(hnsw_config());
        config.dimension = 8;
        config.index_type = IndexType::DiskAnn;
        // A mis-sized fallback would read this instead of the beam width.
        config.hnsw.ef_search = 1;
        let tmp = TempDir::new().unwrap();
        let db = open(tmp.path(), config);

        for i in 0..60 {
            let meta = if i % 3 == 0 {
                tag("bucket", "keep-pile")
            } else {
                tag("bucket", "drop-pile")
            };
            db.add_vector(&synthetic_row(i, 8), &meta).unwrap();
        }

        let filter = Filter::Contains {
            key: "bucket".into(),
            needle: "keep".into(),
        };
        let q = synthetic_row(33, 8); // 33 % 3 == 0, tagged "keep-pile"
        let hits = db.search_filtered(&q, 5, Metric::L2, &filter).unwrap();

        // A beam-sized pool oversamples enough candidates to fill k;
        // sizing off the (deliberately tiny) HNSW knob would not.
        assert_eq!(hits.len(), 5);
        assert_eq!(hits[0].ordinal, 33);
        for hit in &hits {
            assert_eq!(hit.metadata[0].1, MetaValue::Str("keep-pile".into()));
        }
    }

    #[test]
    fn test_compound_filter_with_scan_leaf() {
        let tmp = TempDir::new().unwrap();
        let mut config = hnsw_config();
        config.dimension = 2;
        let db = open(tmp.path(), config);

        for year in 2018..2024 {
            db.add_vector(
                &[year as f32 - 2018.0, 0.0],
                &[
                    ("category".to_string(), MetaValue::Str("paper".into())),
                    ("year".to_string(), MetaValue::Int(year)),
                ],
            )
            .unwrap();
        }

        let filter = Filter::And(vec![
            Filter::eq("category", MetaValue::Str("paper".into())),
            Filter::Cmp {
                key: "year".into(),
                op: CmpOp::Ge,
                value: MetaValue::Int(2022),
            },
        ]);
        let hits = db.search_filtered(&[0.0, 0.0], 10, Metric::L2, &filter).unwrap();
        let mut years: Vec<i64> = hits
            .iter()
            .map(|h| match &h.metadata[1].1 {
                MetaValue::Int(y) => *y,
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        years.sort_unstable();
        assert_eq!(years, vec![2022, 2023]);
    }

    #[test]
    fn test_exact_and_indexed_agree_on_top_results() {
        // Exact fallback equivalence: identical ordinal sets for the
        // same data, modulo tie ordering.
        let tmp_exact = TempDir::new().unwrap();
        let tmp_index = TempDir::new().unwrap();
        let mut config = hnsw_config();
        config.dimension = 8;
        let exact_db = open(tmp_exact.path(), config.clone());
        let indexed_db = open(tmp_index.path(), indexed(config));

        for i in 0..60 {
            let row = synthetic_row(i, 8);
            exact_db.add_vector(&row, &[]).unwrap();
            indexed_db.add_vector(&row, &[]).unwrap();
        }

        for probe in [0usize, 20, 59] {
            let q = synthetic_row(probe, 8);
            let a: Vec<u64> = exact_db
                .search(&q, 5, Metric::L2)
                .unwrap()
                .iter()
                .map(|h| h.ordinal)
                .collect();
            let b: Vec<u64> = indexed_db
                .search(&q, 5, Metric::L2)
                .unwrap()
                .iter()
                .map(|h| h.ordinal)
                .collect();
            assert_eq!(a, b, "probe {probe}");
        }
    }

    #[test]
    fn test_force_exact_search_bypasses_index() {
        let tmp = TempDir::new().unwrap();
        let mut config = indexed(hnsw_config());
        config.force_exact_search = true;
        let db = open(tmp.path(), config);

        for i in 0..20 {
            db.add_vector(&[i as f32, 0.0, 0.0, 0.0], &[]).unwrap();
        }
        let hits = db.search(&[7.0, 0.0, 0.0, 0.0], 1, Metric::L2).unwrap();
        assert_eq!(hits[0].ordinal, 7);
    }

    #[test]
    fn test_range_search_exact_path() {
        let tmp = TempDir::new().unwrap();
        let mut config = hnsw_config();
        config.dimension = 2;
        let db = open(tmp.path(), config);

        for i in 0..10 {
            db.add_vector(&[i as f32, 0.0], &[]).unwrap();
        }

        let hits = db
            .range_search(&[0.0, 0.0], 2.5, Metric::L2, None)
            .unwrap();
        let ordinals: Vec<u64> = hits.iter().map(|h| h.ordinal).collect();
        assert_eq!(ordinals, vec![0, 1, 2]);
        for h in &hits {
            assert!(h.distance <= 2.5);
        }

        let capped = db
            .range_search(&[0.0, 0.0], 2.5, Metric::L2, Some(2))
            .unwrap();
        assert_eq!(capped.len(), 2);

        assert!(db.range_search(&[0.0, 0.0], -1.0, Metric::L2, None).is_err());
    }

    #[test]
    fn test_cosine_normalized_database() {
        // Insert (2,0,0,0); stored norm is 1; cosine
        // search with (1,0,0,0) returns ~0.
        let tmp = TempDir::new().unwrap();
        let mut config = hnsw_config();
        config.cosine_normalized = true;
        let db = open(tmp.path(), config);

        let ordinal = db.add_vector(&[2.0, 0.0, 0.0, 0.0], &[]).unwrap();
        let (stored, _) = db.get(ordinal).unwrap();
        let norm: f32 = stored.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-6);

        let hits = db.search(&[1.0, 0.0, 0.0, 0.0], 1, Metric::Cosine).unwrap();
        assert_eq!(hits[0].ordinal, ordinal);
        assert!(hits[0].distance.abs() < 1e-6);
    }

    #[test]
    fn test_batch_search_is_per_query_independent() {
        let tmp = TempDir::new().unwrap();
        let db = open(tmp.path(), hnsw_config());
        db.add_vector(&[1.0, 0.0, 0.0, 0.0], &[]).unwrap();
        db.add_vector(&[0.0, 1.0, 0.0, 0.0], &[]).unwrap();

        let queries = vec![vec![1.0, 0.0, 0.0, 0.0], vec![0.0, 1.0, 0.0, 0.0]];
        let results = db.search_batch(&queries, 1, Metric::L2).unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0][0].ordinal, 0);
        assert_eq!(results[1][0].ordinal, 1);
    }

    #[test]
    fn test_search_counters_tick() {
        let tmp = TempDir::new().unwrap();
        let db = open(tmp.path(), hnsw_config());
        db.add_vector(&[0.0; 4], &[]).unwrap();
        db.search(&[0.0; 4], 1, Metric::L2).unwrap();
        db.search(&[0.0; 4], 1, Metric::Manhattan).unwrap();
        let stats = db.stats().unwrap();
        assert_eq!(stats.search_count, 2);
        assert_eq!(stats.mutation_count, 1);
    }
}
