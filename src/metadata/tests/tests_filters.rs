#[cfg(test)]
mod tests {
    use crate::metadata::{CmpOp, Filter, MetaPair, MetaValue, MetadataIndex};

    fn row(pairs: &[(&str, MetaValue)]) -> Vec<MetaPair> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    fn cmp(key: &str, op: CmpOp, value: MetaValue) -> Filter {
        Filter::Cmp {
            key: key.into(),
            op,
            value,
        }
    }

    #[test]
    fn test_equality_leaf() {
        let r = row(&[("category", MetaValue::Str("science".into()))]);
        assert!(Filter::eq("category", MetaValue::Str("science".into())).matches(&r));
        assert!(!Filter::eq("category", MetaValue::Str("art".into())).matches(&r));
        assert!(!Filter::eq("missing", MetaValue::Str("science".into())).matches(&r));
    }

    #[test]
    fn test_ordering_leaves_on_ints() {
        let r = row(&[("year", MetaValue::Int(2000))]);
        assert!(cmp("year", CmpOp::Gt, MetaValue::Int(1999)).matches(&r));
        assert!(cmp("year", CmpOp::Ge, MetaValue::Int(2000)).matches(&r));
        assert!(cmp("year", CmpOp::Le, MetaValue::Int(2000)).matches(&r));
        assert!(cmp("year", CmpOp::Lt, MetaValue::Int(2001)).matches(&r));
        assert!(!cmp("year", CmpOp::Lt, MetaValue::Int(2000)).matches(&r));
        assert!(cmp("year", CmpOp::Ne, MetaValue::Int(1999)).matches(&r));
        assert!(!cmp("year", CmpOp::Ne, MetaValue::Int(2000)).matches(&r));
    }

    #[test]
    fn test_int_float_compare_numerically() {
        let r = row(&[("score", MetaValue::Float(2.5))]);
        assert!(cmp("score", CmpOp::Gt, MetaValue::Int(2)).matches(&r));
        assert!(cmp("score", CmpOp::Lt, MetaValue::Int(3)).matches(&r));

        let r2 = row(&[("score", MetaValue::Int(3))]);
        assert!(cmp("score", CmpOp::Eq, MetaValue::Float(3.0)).matches(&r2));
    }

    #[test]
    fn test_cross_type_mismatch_is_false() {
        let r = row(&[("flag", MetaValue::Bool(true))]);
        assert!(!cmp("flag", CmpOp::Eq, MetaValue::Str("true".into())).matches(&r));
        assert!(!cmp("flag", CmpOp::Gt, MetaValue::Int(0)).matches(&r));
        assert!(cmp("flag", CmpOp::Eq, MetaValue::Bool(true)).matches(&r));
    }

    #[test]
    fn test_missing_key_never_matches_even_ne() {
        let r = row(&[("a", MetaValue::Int(1))]);
        assert!(!cmp("b", CmpOp::Ne, MetaValue::Int(0)).matches(&r));
    }

    #[test]
    fn test_prefix_and_contains() {
        let r = row(&[("title", MetaValue::Str("neural networks".into()))]);
        assert!(
            Filter::Prefix {
                key: "title".into(),
                prefix: "neural".into()
            }
            .matches(&r)
        );
        assert!(
            !Filter::Prefix {
                key: "title".into(),
                prefix: "networks".into()
            }
            .matches(&r)
        );
        assert!(
            Filter::Contains {
                key: "title".into(),
                needle: "netw".into()
            }
            .matches(&r)
        );
    }

    #[test]
    fn test_compound_and_or_not() {
        let r = row(&[
            ("category", MetaValue::Str("science".into())),
            ("year", MetaValue::Int(2020)),
        ]);

        let both = Filter::And(vec![
            Filter::eq("category", MetaValue::Str("science".into())),
            cmp("year", CmpOp::Ge, MetaValue::Int(2019)),
        ]);
        assert!(both.matches(&r));

        let either = Filter::Or(vec![
            Filter::eq("category", MetaValue::Str("art".into())),
            cmp("year", CmpOp::Eq, MetaValue::Int(2020)),
        ]);
        assert!(either.matches(&r));

        let negated = Filter::Not(Box::new(Filter::eq(
            "category",
            MetaValue::Str("art".into()),
        )));
        assert!(negated.matches(&r));

        let contradiction = Filter::And(vec![
            Filter::eq("year", MetaValue::Int(2020)),
            Filter::Not(Box::new(cmp("year", CmpOp::Eq, MetaValue::Int(2020)))),
        ]);
        assert!(!contradiction.matches(&r));
    }

    #[test]
    fn test_any_pair_semantics_for_duplicate_keys() {
        let r = row(&[
            ("tag", MetaValue::Str("red".into())),
            ("tag", MetaValue::Str("blue".into())),
        ]);
        assert!(Filter::eq("tag", MetaValue::Str("blue".into())).matches(&r));
        assert!(Filter::eq("tag", MetaValue::Str("red".into())).matches(&r));
        assert!(!Filter::eq("tag", MetaValue::Str("green".into())).matches(&r));
    }

    // --------------------------------------------------------------------------------------------
    // Candidate-set extraction
    // --------------------------------------------------------------------------------------------

    fn sample_index() -> MetadataIndex {
        let mut index = MetadataIndex::new();
        index.add("category", &MetaValue::Str("science".into()), 0);
        index.add("category", &MetaValue::Str("science".into()), 1);
        index.add("category", &MetaValue::Str("art".into()), 2);
        index.add("year", &MetaValue::Int(2020), 1);
        index.add("year", &MetaValue::Int(2021), 2);
        index
    }

    #[test]
    fn test_eq_leaf_is_index_served() {
        let index = sample_index();
        let set = Filter::eq("category", MetaValue::Str("science".into()))
            .candidates(&index)
            .unwrap();
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![0, 1]);
    }

    #[test]
    fn test_ordering_leaf_requires_scan() {
        let index = sample_index();
        assert!(
            cmp("year", CmpOp::Gt, MetaValue::Int(2019))
                .candidates(&index)
                .is_none()
        );
    }

    #[test]
    fn test_and_intersects_served_children() {
        let index = sample_index();
        let filter = Filter::And(vec![
            Filter::eq("category", MetaValue::Str("science".into())),
            Filter::eq("year", MetaValue::Int(2020)),
        ]);
        let set = filter.candidates(&index).unwrap();
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![1]);
    }

    #[test]
    fn test_and_with_unservable_child_still_bounds() {
        let index = sample_index();
        let filter = Filter::And(vec![
            Filter::eq("category", MetaValue::Str("science".into())),
            cmp("year", CmpOp::Ge, MetaValue::Int(2020)),
        ]);
        // The Eq child bounds the candidates; the Ge child is verified later.
        let set = filter.candidates(&index).unwrap();
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![0, 1]);
    }

    #[test]
    fn test_or_unions_or_falls_back() {
        let index = sample_index();
        let served = Filter::Or(vec![
            Filter::eq("category", MetaValue::Str("art".into())),
            Filter::eq("year", MetaValue::Int(2020)),
        ]);
        let set = served.candidates(&index).unwrap();
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![1, 2]);

        let mixed = Filter::Or(vec![
            Filter::eq("category", MetaValue::Str("art".into())),
            cmp("year", CmpOp::Ge, MetaValue::Int(2020)),
        ]);
        assert!(mixed.candidates(&index).is_none());
    }

    #[test]
    fn test_not_requires_scan() {
        let index = sample_index();
        let filter = Filter::Not(Box::new(Filter::eq(
            "category",
            MetaValue::Str("science".into()),
        )));
        assert!(filter.candidates(&index).is_none());
    }

    #[test]
    fn test_prefix_candidates_cover_matching_values() {
        let mut index = MetadataIndex::new();
        index.add("name", &MetaValue::Str("proton".into()), 0);
        index.add("name", &MetaValue::Str("proxima".into()), 1);
        index.add("name", &MetaValue::Str("quark".into()), 2);

        let filter = Filter::Prefix {
            key: "name".into(),
            prefix: "pro".into(),
        };
        let set = filter.candidates(&index).unwrap();
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![0, 1]);
    }
}
